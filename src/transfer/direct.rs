//! Direct path: bytes travel through the command channel.

use std::future::Future;
use std::pin::Pin;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use super::error::commit_failure;
use super::{
    Direction, TransferError, TransferFailure, TransferRequest, TransferRouter, local, script,
};
use crate::cloud::CloudServices;

impl<C: CloudServices + 'static> TransferRouter<C> {
    pub(super) async fn run_direct<I>(
        &self,
        request: &TransferRequest,
        interrupt: Pin<&mut I>,
    ) -> Result<String, TransferError>
    where
        I: Future<Output = ()>,
    {
        let work = async {
            match request.direction {
                Direction::Upload => self.direct_upload(request).await,
                Direction::Download => self.direct_download(request).await,
            }
        };
        let outcome = tokio::select! {
            biased;
            () = interrupt => Err(TransferFailure::Interrupted),
            result = work => result,
        };
        match outcome {
            Ok(digest) => Ok(digest),
            Err(failure) => {
                self.discard_partial(request).await;
                Err(TransferError::new(&request.id, &request.target, None, failure))
            }
        }
    }

    async fn direct_upload(&self, request: &TransferRequest) -> Result<String, TransferFailure> {
        let source = request.local_path();
        let bytes = local::read_all(&source).map_err(|err| TransferFailure::local_io(&source, &err))?;
        let digest = local::digest_bytes(&bytes);
        let destination = request.remote_path();
        let tmp = script::temp_path(destination, &request.id);

        self.exec(request, script::begin_upload(destination, &tmp))
            .await?;
        let mut sent = 0_usize;
        for chunk in bytes.chunks(self.policy.direct_chunk_bytes.max(1)) {
            self.exec(request, script::append_chunk(&tmp, chunk)).await?;
            sent += chunk.len();
            debug!(request_id = %request.id, sent, total = bytes.len(), "chunk delivered");
        }
        self.exec(request, script::commit_upload(&tmp, destination, &digest))
            .await
            .map_err(|err| commit_failure(err, &digest))?;
        Ok(digest)
    }

    async fn direct_download(&self, request: &TransferRequest) -> Result<String, TransferFailure> {
        let source = request.remote_path();
        let expected = self.remote_digest(request).await?;
        let block = self.policy.direct_chunk_bytes.max(1);
        let blocks = request
            .size
            .div_ceil(u64::try_from(block).unwrap_or(u64::MAX));

        let mut bytes = Vec::with_capacity(usize::try_from(request.size).unwrap_or_default());
        for index in 0..blocks {
            let outcome = self
                .exec(request, script::read_chunk(source, block, index))
                .await?;
            let decoded = STANDARD.decode(outcome.stdout.trim()).map_err(|err| {
                TransferFailure::Execution {
                    message: format!("block {index} of {source} is not valid base64: {err}"),
                }
            })?;
            bytes.extend_from_slice(&decoded);
            debug!(request_id = %request.id, received = bytes.len(), "chunk received");
        }

        let actual = local::digest_bytes(&bytes);
        if actual != expected {
            return Err(TransferFailure::Integrity { expected, actual });
        }
        let destination = request.local_path();
        let tmp = local::temp_sibling(&destination, &request.id);
        local::write_file(&tmp, &bytes).map_err(|err| TransferFailure::local_io(&tmp, &err))?;
        local::rename(&tmp, &destination)
            .map_err(|err| TransferFailure::local_io(&destination, &err))?;
        Ok(actual)
    }

    /// Hex SHA-256 digest of the remote source file.
    pub(super) async fn remote_digest(
        &self,
        request: &TransferRequest,
    ) -> Result<String, TransferFailure> {
        let outcome = self
            .exec(request, script::file_digest(request.remote_path()))
            .await?;
        let digest = outcome.stdout.trim();
        if digest.len() != 64 || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(TransferFailure::Execution {
                message: format!("unexpected digest output {digest:?}"),
            });
        }
        Ok(digest.to_ascii_lowercase())
    }
}
