//! Component E: the target-adapter client.
//!
//! `original_source/.../realmfuzzer/adapters/llvm.h` implements this interface by
//! invoking a linked-in `LLVMFuzzerTestOneInput` for every run; its testing counterpart in
//! `realmfuzzer/testing/adapter.h` instead hands control back to the test so it can drive
//! signals explicitly. This crate keeps that same shape: [`TargetAdapter`] is the runner's
//! view of "run this input", [`LlvmTargetAdapter`] calls a linked-in harness function
//! in-process exactly as the original does, and `testing::FakeAdapter` gives tests
//! fine-grained control in place of a real harness.

use async_trait::async_trait;

use crate::error::Result;

/// The runner's view of a target under test: report the harness's declared
/// command-line-style parameters, then run one input at a time.
#[async_trait]
pub trait TargetAdapter: Send + Sync {
    /// Parameters the harness was compiled or configured with (e.g. libFuzzer-style
    /// flags baked into the binary). The runner does not interpret these; they are
    /// surfaced for diagnostics only.
    async fn get_parameters(&self) -> Result<Vec<String>>;

    /// Runs the harness once against `input`. Returning `Ok(())` means the harness
    /// completed the run without the process proxy observing a crash; a crash is instead
    /// detected out-of-band by the process proxy's process-termination watch, since a
    /// faulting run may never return here at all.
    async fn test_one_input(&self, input: &[u8]) -> Result<()>;
}

/// Calls a linked-in fuzz harness function in-process, the same way the original calls
/// `LLVMFuzzerTestOneInput`. The harness runs on a blocking-pool thread so a harness that
/// panics or spins does not stall the single-threaded runner executor.
pub struct LlvmTargetAdapter<F> {
    parameters: Vec<String>,
    harness: std::sync::Arc<F>,
}

impl<F> LlvmTargetAdapter<F>
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    pub fn new(parameters: Vec<String>, harness: F) -> Self {
        LlvmTargetAdapter {
            parameters,
            harness: std::sync::Arc::new(harness),
        }
    }
}

#[async_trait]
impl<F> TargetAdapter for LlvmTargetAdapter<F>
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    async fn get_parameters(&self) -> Result<Vec<String>> {
        Ok(self.parameters.clone())
    }

    async fn test_one_input(&self, input: &[u8]) -> Result<()> {
        let harness = std::sync::Arc::clone(&self.harness);
        let owned = input.to_vec();
        tokio::task::spawn_blocking(move || harness(&owned))
            .await
            .map_err(crate::error::Error::Join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn harness_runs_in_process() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = std::sync::Arc::clone(&count);
        let adapter = LlvmTargetAdapter::new(vec!["-rss_limit_mb=0".to_string()], move |_data| {
            counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        adapter.test_one_input(b"abc").await.unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            adapter.get_parameters().await.unwrap(),
            vec!["-rss_limit_mb=0".to_string()]
        );
    }
}
