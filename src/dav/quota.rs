//! Pre-write free space check

use super::chunking::ChunkAssembler;
use crate::context::RequestContext;
use crate::error::{DavError, DavResult, ErrorKind};
use crate::types::{split_path, ChunkName, FreeSpace};
use tracing::{debug, instrument};

/// Rejects writes whose declared size cannot fit in the known free space.
pub struct QuotaGate<'a> {
    ctx: &'a RequestContext,
}

impl<'a> QuotaGate<'a> {
    pub fn new(ctx: &'a RequestContext) -> Self {
        Self { ctx }
    }

    /// Check a pending write to `path`.
    ///
    /// The required length is the larger of the declared total and request
    /// lengths. For a chunked transfer, bytes already stored are subtracted
    /// and the transfer's chunks are discarded on rejection. Unknown or
    /// unlimited free space always passes; the boundary is inclusive.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        path: &str,
        expected_length: Option<u64>,
        total_length: Option<u64>,
        chunked: bool,
    ) -> DavResult<()> {
        let mut length = total_length
            .unwrap_or(0)
            .max(expected_length.unwrap_or(0));
        if length == 0 {
            return Ok(());
        }

        let (parent, leaf) = split_path(path);
        let mut assembler = None;
        if chunked {
            if let Some(chunk) = ChunkName::parse(&leaf) {
                let a = ChunkAssembler::new(self.ctx, chunk, &parent);
                length = length.saturating_sub(a.current_size().await);
                assembler = Some(a);
            }
        }

        match self.ctx.view.free_space(&parent).await {
            FreeSpace::Known(free) if length > free => {
                if let Some(a) = assembler {
                    a.cleanup().await;
                }
                Err(DavError::new(
                    ErrorKind::QuotaExceeded,
                    format!(
                        "Insufficient space in {}, {} required, {} available",
                        parent, length, free
                    ),
                ))
            }
            free => {
                debug!("Quota ok for {}: {} bytes, free {:?}", path, length, free);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dav::test_support::{test_context, FaultyView};
    use crate::dav::upload::{PutRequest, UploadPipeline};
    use std::sync::Arc;

    async fn gated(free: FreeSpace) -> (tempfile::TempDir, RequestContext) {
        let (dir, mut ctx) = test_context().await;
        ctx.view = Arc::new(FaultyView::new(ctx.view.clone()).with_free_space(free));
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_boundary_is_inclusive() {
        let (_dir, ctx) = gated(FreeSpace::Known(100)).await;
        let gate = QuotaGate::new(&ctx);
        assert!(gate.check("/a.bin", Some(100), None, false).await.is_ok());
        let err = gate.check("/a.bin", Some(101), None, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_larger_of_total_and_expected_is_used() {
        let (_dir, ctx) = gated(FreeSpace::Known(50)).await;
        let gate = QuotaGate::new(&ctx);
        let err = gate.check("/a.bin", Some(10), Some(60), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_unknown_and_unlimited_space_pass() {
        for free in [FreeSpace::Unknown, FreeSpace::Unlimited] {
            let (_dir, ctx) = gated(free).await;
            assert!(QuotaGate::new(&ctx)
                .check("/a.bin", Some(u64::MAX), None, false)
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn test_zero_length_skips_check() {
        let (_dir, ctx) = gated(FreeSpace::Known(0)).await;
        assert!(QuotaGate::new(&ctx).check("/a.bin", None, None, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_chunked_subtracts_stored_bytes_and_cleans_up() {
        let (_dir, ctx) = gated(FreeSpace::Known(6)).await;
        let req = PutRequest::new("/c.bin-chunking-1-3-0", &b"abcd"[..]).chunked();
        UploadPipeline::new(&ctx).put(req, None).await.unwrap();

        let gate = QuotaGate::new(&ctx);
        // 10 total, 4 stored: 6 needed
        assert!(gate
            .check("/c.bin-chunking-1-3-1", Some(3), Some(10), true)
            .await
            .is_ok());

        let err = gate
            .check("/c.bin-chunking-1-3-1", Some(3), Some(11), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        let a = ChunkAssembler::for_path(&ctx, "/c.bin-chunking-1-3-1").unwrap();
        assert_eq!(a.current_size().await, 0);
    }
}
