//! Signature capture: attest, encrypt, enqueue.

use crate::attestation::Attestor;
use crate::clock::{Clock, SystemClock};
use crate::crypto::{encrypt, DeviceKey};
use crate::enrollment::Enrollment;
use crate::queue::{PendingSignatureRecord, QueueHandle};
use crate::Result;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Input from the signature pad. PIN and strokes are wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CaptureRequest {
    pub request_id: i64,
    pub worker_id: i64,
    pub rut: String,
    pub pin: String,
    /// Raw signature strokes as produced by the pad
    pub signature: Vec<u8>,
}

impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("request_id", &self.request_id)
            .field("worker_id", &self.worker_id)
            .field("signature_len", &self.signature.len())
            .finish_non_exhaustive()
    }
}

/// Front end used by the capture UI.
///
/// Attestation and encryption happen locally; the returned future resolves
/// once the encrypted record is durably queued. No network access.
pub struct SignatureCapture {
    attestor: Attestor,
    key: Arc<DeviceKey>,
    queue: QueueHandle,
    clock: Arc<dyn Clock>,
}

impl SignatureCapture {
    pub fn new(enrollment: &Enrollment, queue: QueueHandle) -> Self {
        Self {
            attestor: enrollment.attestor().clone(),
            key: enrollment.key(),
            queue,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attest the signer and seal the strokes into a new record.
    ///
    /// Fails with [`crate::FieldSignError::InvalidPin`] before anything is
    /// encrypted when the PIN does not match.
    pub fn prepare_record(&self, request: &CaptureRequest) -> Result<PendingSignatureRecord> {
        let attestation = self.attestor.attest(&request.rut, &request.pin)?;
        let blob = encrypt(&self.key, &request.signature)?;

        Ok(PendingSignatureRecord::new(
            request.request_id,
            request.worker_id,
            blob,
            self.clock.now(),
            attestation,
        ))
    }

    /// Capture a signature; returns its `local_id` once stored.
    pub async fn capture(&self, request: CaptureRequest) -> Result<Uuid> {
        let record = self.prepare_record(&request)?;
        drop(request);

        let local_id = record.local_id;
        let request_id = record.request_id;
        self.queue.append(record).await?;

        info!(%local_id, request_id, "Signature captured");
        Ok(local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{PinVerifier, Rut};
    use crate::crypto::{decrypt, PinKdfParams};
    use crate::queue::{serve, SignatureQueue, SyncState};
    use crate::FieldSignError;

    fn enrollment() -> Enrollment {
        let params = PinKdfParams {
            mem_cost: 8_192,
            time_cost: 1,
            parallelism: 1,
        };
        Enrollment::new(
            Uuid::new_v4(),
            DeviceKey::generate(),
            Attestor::new(
                Rut::parse("12.345.678-5").unwrap(),
                PinVerifier::create("1357", params).unwrap(),
            ),
        )
    }

    fn request(pin: &str) -> CaptureRequest {
        CaptureRequest {
            request_id: 42,
            worker_id: 3,
            rut: "12.345.678-5".to_string(),
            pin: pin.to_string(),
            signature: b"M10,10 L20,20".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_capture_queues_encrypted_record() {
        let enrollment = enrollment();
        let (handle, rx) = QueueHandle::channel(4);
        let writer = tokio::spawn(serve(SignatureQueue::in_memory().unwrap(), rx));

        let capture = SignatureCapture::new(&enrollment, handle.clone());
        let id = capture.capture(request("1357")).await.unwrap();
        handle.shutdown().await.unwrap();

        let queue = writer.await.unwrap();
        let record = queue.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.request_id, 42);
        assert_ne!(record.signature_blob.as_bytes(), b"M10,10 L20,20");

        let plaintext = decrypt(&enrollment.key(), &record.signature_blob).unwrap();
        assert_eq!(plaintext.as_bytes(), b"M10,10 L20,20");
        assert_eq!(record.attestation_hash.as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_wrong_pin_queues_nothing() {
        let enrollment = enrollment();
        let (handle, rx) = QueueHandle::channel(4);
        let writer = tokio::spawn(serve(SignatureQueue::in_memory().unwrap(), rx));

        let capture = SignatureCapture::new(&enrollment, handle.clone());
        assert!(matches!(
            capture.capture(request("0000")).await,
            Err(FieldSignError::InvalidPin)
        ));
        drop(capture);
        drop(handle);

        let queue = writer.await.unwrap();
        assert_eq!(queue.stats().unwrap().depth, 0);
    }

    #[test]
    fn test_debug_omits_secrets() {
        let rendered = format!("{:?}", request("1357"));
        assert!(!rendered.contains("1357"));
        assert!(!rendered.contains("12.345.678-5"));
    }
}
