//! Auto-registration of unrecognized faces.
//!
//! Runs only while the caller holds the content's dedup lock. Steps, each
//! failure ending the run:
//!
//! 1. persist the image pair
//! 2. confirm enough of the lock is left for the remaining steps
//! 3. insert the identity (on failure, delete the image pair)
//! 4. append the success audit row, announce the identity to the fleet
//! 5. open the cooldown window
//!
//! Every step from 3 on is bounded, and step 2 only lets the run continue
//! if all of them fit inside the lock. A run that cannot finish before its
//! lock expires registers nothing, so a handler admitted after the expiry
//! never races it. The lock is released on every path, and exactly one
//! audit row is written.

use crate::backend::{bounded, StoreError};
use crate::dedup::HeldLock;
use crate::image_store::ImageError;
use crate::pipeline::PipelineContext;
use crate::types::{AuditRecord, EventKind, FaceImagePair, IdentityRecord, InboundEvent, STRANGER_NAME};
use chrono::{DateTime, Local};
use std::time::Duration;
use uuid::Uuid;

const SNAP_IMAGE_PREFIX: &str = "snap_";
const SHORT_ID_PREFIX: &str = "NV_";
const SHORT_ID_HEX_LEN: usize = 13;

#[derive(Debug)]
pub enum WorkflowOutcome {
    Registered {
        identity: IdentityRecord,
        images: FaceImagePair,
        /// `false` if the `EditPerson` command could not be published.
        notified: bool,
        /// `false` if the cooldown marker could not be written.
        cooldown_started: bool,
    },
    ImagePersistFailed(ImageError),
    IdentityInsertFailed(StoreError),
    /// Too little of the lock was left to finish; nothing was registered.
    LockExpired { remaining: Duration },
}

/// New person identifier: `NV_` followed by 13 hex digits.
pub fn new_short_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{SHORT_ID_PREFIX}{}", &hex[..SHORT_ID_HEX_LEN])
}

/// Placeholder name for an auto-registered stranger, e.g. `Stranger 15/10 09:41`.
pub fn stranger_display_name(at: DateTime<Local>) -> String {
    format!("{STRANGER_NAME} {}", at.format("%d/%m %H:%M"))
}

/// Worst-case time from the identity insert to the cooldown write: insert,
/// audit append and publish at the I/O bound, then one key-value call.
pub fn commit_budget(ctx: &PipelineContext) -> Duration {
    ctx.io_timeout * 3 + ctx.dedup.config().op_timeout
}

/// Register the face in `payload` as a new person.
pub async fn register(
    ctx: &PipelineContext,
    lock: HeldLock,
    event: &InboundEvent,
    payload: &str,
    hash: &str,
) -> WorkflowOutcome {
    let event_time = event.event_time();
    let short_id = new_short_id();

    let images = match ctx
        .images
        .save_bounded(payload, SNAP_IMAGE_PREFIX, &short_id, ctx.io_timeout)
        .await
    {
        Ok(images) => images,
        Err(e) => {
            tracing::warn!(hash, error = %e, "could not store stranger image; skipping registration");
            ctx.events.append(AuditRecord::stranger(event_time)).await;
            lock.release().await;
            return WorkflowOutcome::ImagePersistFailed(e);
        }
    };

    let remaining = lock.remaining();
    let needed = commit_budget(ctx);
    if remaining < needed {
        tracing::warn!(hash, ?remaining, ?needed, "lock too close to expiry; abandoning registration");
        discard_images(ctx, &images).await;
        ctx.events.append(AuditRecord::stranger(event_time)).await;
        lock.release().await;
        return WorkflowOutcome::LockExpired { remaining };
    }

    let identity = IdentityRecord {
        short_id,
        person_name: stranger_display_name(Local::now()),
        registration_photo_path: images.photos_path.clone(),
    };

    if let Err(e) = bounded(ctx.io_timeout, ctx.identities.insert_identity(&identity)).await {
        tracing::error!(short_id = %identity.short_id, error = %e, "identity insert failed");
        if undo_identity(ctx, &identity.short_id, &e).await {
            discard_images(ctx, &images).await;
        }
        ctx.events.append(AuditRecord::stranger(event_time)).await;
        lock.release().await;
        return WorkflowOutcome::IdentityInsertFailed(e);
    }

    tracing::info!(short_id = %identity.short_id, name = %identity.person_name, "stranger auto-registered");

    ctx.events
        .append(AuditRecord {
            event_type: EventKind::Unrecognized,
            person_name: identity.person_name.clone(),
            person_id: Some(identity.short_id.clone()),
            similarity: None,
            record_id: None,
            event_time,
            image_path: Some(images.faces_path.clone()),
        })
        .await;

    // The identity is committed; a missed announcement is recoverable.
    let notified = ctx
        .notifier
        .announce(
            &event.command_topic,
            &identity.short_id,
            &identity.person_name,
            &images.photos_path,
        )
        .await;

    if lock.remaining().is_zero() {
        tracing::error!(hash, "lock lapsed before the cooldown was set; a duplicate may have been admitted");
    }
    let cooldown_started = match ctx.dedup.start_cooldown(hash).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(hash, error = %e, "failed to start cooldown");
            false
        }
    };

    lock.release().await;

    WorkflowOutcome::Registered {
        identity,
        images,
        notified,
        cooldown_started,
    }
}

/// A timed-out insert may still commit after the deadline. Remove whatever
/// landed under `short_id` before the images it points at are deleted.
/// Returns `false` when the row's state is unknown and the images must stay.
async fn undo_identity(ctx: &PipelineContext, short_id: &str, cause: &StoreError) -> bool {
    if !matches!(cause, StoreError::Timeout(_)) {
        return true;
    }
    match bounded(ctx.io_timeout, ctx.identities.remove_identity(short_id)).await {
        Ok(true) => {
            tracing::warn!(short_id, "identity committed after its deadline; rolled back");
            true
        }
        Ok(false) => true,
        Err(e) => {
            tracing::error!(short_id, error = %e, "identity state unknown; keeping its images");
            false
        }
    }
}

async fn discard_images(ctx: &PipelineContext, images: &FaceImagePair) {
    if let Err(e) = ctx.images.remove_async(images).await {
        tracing::error!(file = %images.file_name(), error = %e, "image cleanup failed");
    }
}
