//! Profiling hooks.
//! Spans are only recorded when the crate is built with the `trace` feature.

pub use tracy_client;

/// Opens a tracy span named after the calling module and the given label.
/// The span ends when the returned guard is dropped.
#[macro_export]
macro_rules! span {
    ($label: literal) => {
        $crate::trace_utils::tracy_client::Span::new(
            "",
            ::std::concat!(::std::module_path!(), " ", $label),
            ::std::file!(),
            ::std::line!(),
            16,
        )
    };
}
