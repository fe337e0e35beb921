/*!
 * Local Copy Services
 * Synchronous copies between two mapped SMBs
 *
 * Used for co-located ports and for host shared memory. Completion is
 * immediate: the copy has happened by the time `post` returns.
 */

use super::traits::{XferRequest, XferServices};
use super::types::{posting_order, CompletionStatus, CopyOp, XferFlags};
use crate::core::errors::DataplaneResult;
use crate::core::types::Offset;
use crate::smb::{Region, SmemServices};
use std::sync::Arc;

pub struct LocalCopyServices {
    source: Arc<SmemServices>,
    target: Arc<SmemServices>,
}

impl LocalCopyServices {
    /// Both SMBs must be mapped in this process
    pub fn new(source: Arc<SmemServices>, target: Arc<SmemServices>) -> DataplaneResult<Self> {
        source.region()?;
        target.region()?;
        Ok(Self { source, target })
    }
}

impl XferServices for LocalCopyServices {
    fn source(&self) -> &Arc<SmemServices> {
        &self.source
    }

    fn target(&self) -> &Arc<SmemServices> {
        &self.target
    }

    fn create_request(&self) -> DataplaneResult<Box<dyn XferRequest>> {
        Ok(Box::new(LocalCopyRequest {
            source: self.source.region()?.clone(),
            target: self.target.region()?.clone(),
            copies: Vec::new(),
            posted: false,
        }))
    }
}

struct LocalCopyRequest {
    source: Arc<Region>,
    target: Arc<Region>,
    copies: Vec<CopyOp>,
    posted: bool,
}

impl XferRequest for LocalCopyRequest {
    fn copy(&mut self, src: Offset, dst: Offset, len: u64, flags: XferFlags) -> DataplaneResult<()> {
        self.copies.push(CopyOp { src, dst, len, flags });
        Ok(())
    }

    fn post(&mut self) -> DataplaneResult<()> {
        for op in posting_order(&self.copies) {
            Region::copy_between(&self.source, op.src, &self.target, op.dst, op.len)?;
        }
        self.posted = true;
        Ok(())
    }

    fn status(&mut self) -> DataplaneResult<CompletionStatus> {
        Ok(if self.posted {
            CompletionStatus::CompleteSuccess
        } else {
            CompletionStatus::Pending
        })
    }

    fn copy_count(&self) -> usize {
        self.copies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::xfer::SmemBackend;
    use pretty_assertions::assert_eq;

    fn smem(name: &str) -> Arc<SmemServices> {
        let mut endpoint = Endpoint::parse(&format!("ocpi-smb-pio:{}:4096.0.1", name)).unwrap();
        endpoint.finalize();
        Arc::new(
            SmemServices::new(endpoint, Some(Arc::new(Region::new(4096))), true, SmemBackend::Remote)
                .unwrap(),
        )
    }

    #[test]
    fn test_copies_land_on_post() {
        let source = smem("src");
        let target = smem("dst");
        source.region().unwrap().write_bytes(100, b"payload").unwrap();
        source.region().unwrap().write_u64(200, 0xfeed).unwrap();

        let services = LocalCopyServices::new(source.clone(), target.clone()).unwrap();
        let mut request = services.create_request().unwrap();
        request.copy(200, 8, 8, XferFlags::FLAG_TRANSFER).unwrap();
        request.copy(100, 64, 7, XferFlags::DATA_TRANSFER).unwrap();
        assert_eq!(request.status().unwrap(), CompletionStatus::Pending);

        request.post().unwrap();
        assert_eq!(request.status().unwrap(), CompletionStatus::CompleteSuccess);
        assert_eq!(request.copy_count(), 2);
        assert_eq!(target.region().unwrap().read_bytes(64, 7).unwrap(), b"payload".to_vec());
        assert_eq!(target.region().unwrap().read_u64(8).unwrap(), 0xfeed);
    }

    #[test]
    fn test_out_of_bounds_copy_fails_on_post() {
        let source = smem("a");
        let target = smem("b");
        let services = LocalCopyServices::new(source, target).unwrap();
        let mut request = services.create_request().unwrap();
        request.copy(0, 4090, 16, XferFlags::empty()).unwrap();
        assert!(request.post().is_err());
    }
}
