#![macro_use]

/// Declare a transparent `NonNull` handle to a C object of libibverbs or
/// librdmacm. The handle dereferences to the pointer and may cross threads.
///
/// Handles do not own anything; the wrapper that holds one decides when the
/// object is destroyed.
macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident => $raw:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub(crate) struct $name(::std::ptr::NonNull<$raw>);

        impl ::std::ops::Deref for $name {
            type Target = ::std::ptr::NonNull<$raw>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        // SAFETY: verbs and rdma_cm objects are thread-safe.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}
