//! Human-readable error descriptions and structured JSON error formatting.

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    use cryomon_core::error::{InstrumentError, UploadError};

    // Typed matches first
    if let Some(ue) = err.downcast_ref::<UploadError>() {
        return match ue {
            UploadError::Status { status, body } if (400..500).contains(status) => format!(
                "What happened: The store rejected the upload (HTTP {status}: {body}).\nLikely causes: upload.fridge or a supp name is not registered on the server.\nHow to fix: Register the dataset on the server, or correct upload.fridge / supp in the config."
            ),
            UploadError::Status { status, body } => format!(
                "What happened: The store returned HTTP {status} ({body}).\nLikely causes: Server-side trouble; during a run these are retried automatically.\nHow to fix: Check the store's health if this persists."
            ),
            UploadError::Transport(msg) => format!(
                "What happened: Could not reach the store ({msg}).\nLikely causes: Network trouble, or upload.base_url points at the wrong host.\nHow to fix: Verify upload.base_url and connectivity to the server."
            ),
            UploadError::BadResponse(msg) => format!(
                "What happened: The store answered with something unexpected ({msg}).\nLikely causes: upload.base_url points at a proxy page or the wrong service.\nHow to fix: Verify the URL serves the monitoring API."
            ),
        };
    }

    if let Some(ie) = err.downcast_ref::<InstrumentError>() {
        // Specific wiring cases first
        if matches!(ie, InstrumentError::Timeout | InstrumentError::Io(_)) {
            return format!(
                "What happened: An instrument stopped answering ({ie}).\nLikely causes: Wrong address or device path in the config, an unplugged cable, or the instrument is powered off.\nHow to fix: Check the uploader's address against the instrument, then its front panel and cabling."
            );
        }
        if let InstrumentError::ChannelChanged { expected, found } = ie {
            return format!(
                "What happened: The resistance bridge switched from channel {expected} to {found} mid-scan.\nLikely causes: Someone turned the front-panel selector while the monitor was scanning.\nHow to fix: Leave the selector alone during a run; the scan restarts on its own."
            );
        }
        // Fallback to generic for other protocol errors
        return format!(
            "What happened: {ie}.\nLikely causes: Line noise or a protocol/address mismatch.\nHow to fix: Check wiring and the uploader's settings; re-run with --log-level=debug for the exchange."
        );
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("log directory") || lower.contains("no log file") {
        return format!(
            "What happened: A vendor log tree could not be read.\nLikely causes: log_dir points at the wrong place, or the fridge software has not written today's folder yet.\nHow to fix: Point log_dir at the control software's log output and check permissions.\nOriginal: {msg}"
        );
    }

    if lower.contains("calibration") || lower.contains("excitation") {
        return format!(
            "What happened: A bridge channel references settings that are not defined.\nLikely causes: A typo in a channel's calibration or excitation name.\nHow to fix: Run `check-config` and compare the names against [calibration] entries.\nOriginal: {msg}"
        );
    }

    if lower.contains("upload.enabled") {
        return format!(
            "What happened: Uploading is switched off in the config.\nHow to fix: Set upload.enabled = true (use --mock to rehearse without posting).\nOriginal: {msg}"
        );
    }

    if lower.contains("invalid configuration") || lower.contains("config") {
        return format!(
            "What happened: Configuration is invalid or incomplete.\nLikely causes: Missing [upload] values or a misconfigured [[uploader]] table.\nHow to fix: Edit the TOML config and check it with `check-config`.\nOriginal: {msg}"
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Map upload/instrument failures to stable exit codes; config errors exit 2
/// at the call site, everything else returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    use cryomon_core::error::{InstrumentError, UploadError};
    if let Some(ue) = err.downcast_ref::<UploadError>() {
        return match ue {
            UploadError::Status { status, .. } if (400..500).contains(status) => 3,
            _ => 4,
        };
    }
    if err.downcast_ref::<InstrumentError>().is_some() {
        return 5;
    }
    1
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use cryomon_core::error::{InstrumentError, UploadError};
    use serde_json::json;

    if let Some(ue) = err.downcast_ref::<UploadError>() {
        let msg = humanize(err);
        let (reason, detail) = match ue {
            UploadError::Status { status, .. } => {
                ("StoreRejected", Some(json!({ "status": status })))
            }
            UploadError::Transport(_) => ("StoreUnreachable", None),
            UploadError::BadResponse(_) => ("StoreBadResponse", None),
        };
        let obj = if let Some(d) = detail {
            json!({ "reason": reason, "details": d, "message": msg })
        } else {
            json!({ "reason": reason, "message": msg })
        };
        return obj.to_string();
    }

    if err.downcast_ref::<InstrumentError>().is_some() {
        return json!({ "reason": "Instrument", "message": humanize(err) }).to_string();
    }

    // Generic error JSON
    json!({ "reason": "Error", "message": humanize(err) }).to_string()
}
