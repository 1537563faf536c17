use core::time::Duration;

/// Platform services the engine consumes. Ring memory comes from `dma-api`,
/// whose platform hook is registered separately with `dma_api::set_impl!`.
pub trait Kernel: Send + Sync {
    /// Segment alignment; a ring segment never crosses a page.
    fn page_size(&self) -> usize;
    /// Monotonic time, used only by the Stop Endpoint watchdog.
    fn now(&self) -> Duration;
}
