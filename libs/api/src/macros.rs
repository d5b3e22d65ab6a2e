//! Resource trait boilerplate.

/// Implements [`kplane_store::Resource`] for a `{ metadata, spec, status }`
/// struct of a fixed kind.
macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl kplane_store::Resource for $ty {
            fn kind(&self) -> &str {
                $kind
            }

            fn meta(&self) -> &kplane_store::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut kplane_store::ObjectMeta {
                &mut self.metadata
            }

            fn set_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        }
    };
}

pub(crate) use impl_resource;
