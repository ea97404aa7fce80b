//! Per-message handling.
//!
//! [`handle_message`] is stateless: every collaborator comes in through the
//! [`PipelineContext`] so the transport loop, the tests, and any replay tool
//! drive the same code.

use crate::backend::IdentityStore;
use crate::classifier::classify;
use crate::dedup::{content_hash, DedupCoordinator, LockOutcome};
use crate::event_log::EventLogWriter;
use crate::image_store::ImageStore;
use crate::notifier::Notifier;
use crate::types::{AuditRecord, EventKind, FaceImagePair, InboundEvent};
use crate::workflow::{self, WorkflowOutcome};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const REC_IMAGE_PREFIX: &str = "rec_";
/// Stored when a recognized event omits a field.
const NOT_AVAILABLE: &str = "N/A";

/// Capabilities a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub images: ImageStore,
    pub identities: Arc<dyn IdentityStore>,
    pub events: EventLogWriter,
    pub notifier: Notifier,
    pub dedup: DedupCoordinator,
    /// Upper bound on each image write and database call.
    pub io_timeout: Duration,
}

/// What happened to one classified message.
#[derive(Debug)]
pub enum HandleOutcome {
    Recognized { image: Option<FaceImagePair> },
    /// `Snap` without an image: logged, nothing else.
    MissingPicture,
    AlreadyLocked,
    CooldownActive,
    Registration(WorkflowOutcome),
}

/// Handle one raw message. Returns `None` when the message was dropped by
/// the classifier; every `Some` outcome wrote exactly one audit row.
pub async fn handle_message(
    ctx: &PipelineContext,
    topic: &str,
    payload: &[u8],
) -> Option<HandleOutcome> {
    let event = classify(topic, payload)?;
    tracing::debug!(topic, kind = %event.kind, device = ?event.device_id, "face event received");

    let outcome = match event.kind {
        EventKind::Recognized => handle_recognized(ctx, &event).await,
        EventKind::Unrecognized => handle_unrecognized(ctx, &event).await,
    };
    Some(outcome)
}

async fn handle_recognized(ctx: &PipelineContext, event: &InboundEvent) -> HandleOutcome {
    let person_id = event.person_id();

    let image = match event.picture() {
        Some(pic) => {
            let seed = person_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            match ctx
                .images
                .save_bounded(pic, REC_IMAGE_PREFIX, &seed, ctx.io_timeout)
                .await
            {
                Ok(pair) => Some(pair),
                Err(e) => {
                    tracing::warn!(person_id = ?person_id, error = %e, "could not store recognition image");
                    None
                }
            }
        }
        None => None,
    };

    ctx.events
        .append(AuditRecord {
            event_type: EventKind::Recognized,
            person_name: event.person_name().unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            person_id: Some(person_id.unwrap_or_else(|| NOT_AVAILABLE.to_string())),
            similarity: Some(event.f64_field("similarity1").unwrap_or(0.0)),
            record_id: Some(event.i64_field("RecordID").unwrap_or(0)),
            event_time: event.event_time(),
            image_path: image.as_ref().map(|p| p.faces_path.clone()),
        })
        .await;

    HandleOutcome::Recognized { image }
}

async fn handle_unrecognized(ctx: &PipelineContext, event: &InboundEvent) -> HandleOutcome {
    let Some(pic) = event.picture() else {
        tracing::warn!(topic = %event.topic, "Snap event without pic");
        ctx.events.append(AuditRecord::stranger(event.event_time())).await;
        return HandleOutcome::MissingPicture;
    };

    let hash = content_hash(pic);
    match ctx.dedup.try_admit(&hash).await {
        LockOutcome::Admitted(lock) => {
            HandleOutcome::Registration(workflow::register(ctx, lock, event, pic, &hash).await)
        }
        LockOutcome::AlreadyLocked => {
            ctx.events.append(AuditRecord::stranger(event.event_time())).await;
            HandleOutcome::AlreadyLocked
        }
        LockOutcome::CooldownActive => {
            ctx.events.append(AuditRecord::stranger(event.event_time())).await;
            HandleOutcome::CooldownActive
        }
    }
}
