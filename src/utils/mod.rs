/// Provide interoperability with C return values.
pub(crate) mod interop;

/// Raw handle declarations.
#[macro_use]
pub(crate) mod boilerplate;
