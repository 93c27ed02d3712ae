use chrono::{Duration, Utc};
use shared::{
    domain::{ActivityAction, StopwatchId},
    error::{ApiError, ErrorCode},
    protocol::{ActivityEntry, LapSummary, StopwatchCommand, StopwatchSnapshot},
};
use storage::Storage;
use tracing::info;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Reads the canonical snapshot for one stopwatch, lazily creating the
/// default paused row on first contact.
pub async fn current_snapshot(
    ctx: &ApiContext,
    stopwatch_id: &StopwatchId,
) -> Result<StopwatchSnapshot, ApiError> {
    let state = ctx
        .storage
        .ensure_stopwatch(stopwatch_id)
        .await
        .map_err(internal)?;
    let laps = ctx
        .storage
        .list_laps(stopwatch_id)
        .await
        .map_err(internal)?;

    Ok(StopwatchSnapshot {
        stopwatch_id: state.stopwatch_id.0,
        is_running: state.is_running,
        start_time: state.start_time,
        elapsed_time: state.elapsed_time,
        laps: laps
            .into_iter()
            .map(|lap| LapSummary::new(lap.lap_id, lap.time))
            .collect(),
    })
}

/// Applies one command against the persisted state and returns the re-read
/// canonical snapshot. Transitions that do not change state (start while
/// running, pause while paused) write nothing and log nothing. Every state
/// write is guarded by the version read alongside the old state; a mismatch
/// means another client won the race and the caller should retry against the
/// fresh snapshot.
pub async fn apply_command(
    ctx: &ApiContext,
    stopwatch_id: &StopwatchId,
    command: StopwatchCommand,
) -> Result<StopwatchSnapshot, ApiError> {
    let state = ctx
        .storage
        .ensure_stopwatch(stopwatch_id)
        .await
        .map_err(internal)?;
    let now = Utc::now();

    match command {
        StopwatchCommand::Start => {
            if !state.is_running {
                // Resume from the accumulated total: anchor the run so that
                // now - start_time == elapsed_time at the instant of starting.
                let start_time = now - Duration::milliseconds(state.elapsed_time);
                let applied = ctx
                    .storage
                    .write_state(
                        stopwatch_id,
                        true,
                        start_time,
                        state.elapsed_time,
                        state.version,
                    )
                    .await
                    .map_err(internal)?;
                if !applied {
                    return Err(conflict());
                }
                log_activity(ctx, stopwatch_id, ActivityAction::Start, None).await?;
                info!(stopwatch_id = %stopwatch_id, "stopwatch started");
            }
        }
        StopwatchCommand::Pause => {
            if state.is_running {
                let elapsed = (now - state.start_time).num_milliseconds().max(0);
                let applied = ctx
                    .storage
                    .write_state(stopwatch_id, false, state.start_time, elapsed, state.version)
                    .await
                    .map_err(internal)?;
                if !applied {
                    return Err(conflict());
                }
                log_activity(ctx, stopwatch_id, ActivityAction::Pause, None).await?;
                info!(stopwatch_id = %stopwatch_id, elapsed_ms = elapsed, "stopwatch paused");
            }
        }
        StopwatchCommand::Lap { current_time } => {
            if !state.is_running {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "stopwatch is not running",
                ));
            }
            if current_time < 0 {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "lap time cannot be negative",
                ));
            }
            // The lap value is trusted from the caller; all clients derive it
            // from the same synchronized start_time anchor.
            ctx.storage
                .insert_lap(stopwatch_id, current_time)
                .await
                .map_err(internal)?;
            let details = format!("Time: {current_time}ms");
            log_activity(ctx, stopwatch_id, ActivityAction::Lap, Some(&details)).await?;
            info!(stopwatch_id = %stopwatch_id, lap_ms = current_time, "lap recorded");
        }
        StopwatchCommand::Reset => {
            let applied = ctx
                .storage
                .reset_stopwatch(stopwatch_id, now, state.version)
                .await
                .map_err(internal)?;
            if !applied {
                return Err(conflict());
            }
            log_activity(ctx, stopwatch_id, ActivityAction::Reset, None).await?;
            info!(stopwatch_id = %stopwatch_id, "stopwatch reset");
        }
    }

    current_snapshot(ctx, stopwatch_id).await
}

pub async fn list_activity(
    ctx: &ApiContext,
    stopwatch_id: &StopwatchId,
) -> Result<Vec<ActivityEntry>, ApiError> {
    let entries = ctx
        .storage
        .list_activity(stopwatch_id)
        .await
        .map_err(internal)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            ActivityEntry::new(
                entry.activity_id,
                entry.action,
                entry.details,
                entry.created_at,
            )
        })
        .collect())
}

async fn log_activity(
    ctx: &ApiContext,
    stopwatch_id: &StopwatchId,
    action: ActivityAction,
    details: Option<&str>,
) -> Result<(), ApiError> {
    ctx.storage
        .append_activity(stopwatch_id, action, details)
        .await
        .map_err(internal)?;
    Ok(())
}

fn conflict() -> ApiError {
    ApiError::new(
        ErrorCode::Conflict,
        "stopwatch state changed concurrently; retry with the latest snapshot",
    )
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, error.to_string())
}
