//! Operator-facing summaries
//!
//! Every cancellation, confirmation and failure produces one of these, naming
//! the counterpart and the reason. They are logged by the state machine and
//! printed by the terminal prompt.

use super::events::*;
use std::collections::BTreeSet;

/// Counterpart does not offer the emoji method
pub fn msg_unsupported_methods(sender: &UserId, methods: &[String]) -> String {
    format!(
        "{} does not support emoji verification (offered: {}).",
        sender,
        if methods.is_empty() {
            "nothing".to_string()
        } else {
            methods.join(", ")
        }
    )
}

/// Counterpart cancelled; nothing to send back
pub fn msg_cancelled_by_counterpart(sender: &UserId, reason: &str) -> String {
    format!(
        "Verification has been cancelled by {} for reason \"{}\".",
        sender, reason
    )
}

pub fn msg_sas_confirmed(counterpart: &UserId) -> String {
    format!(
        "Match! The verification with {} will be accepted.",
        counterpart
    )
}

pub fn msg_sas_rejected(counterpart: &UserId) -> String {
    format!(
        "No match! The device of {} will NOT be verified; verification rejected.",
        counterpart
    )
}

pub fn msg_cancelled_by_user(counterpart: &UserId) -> String {
    format!(
        "Cancelled by user! Verification with {} will be cancelled.",
        counterpart
    )
}

pub fn msg_timed_out(counterpart: &UserId) -> String {
    format!(
        "Verification with {} timed out and has been cancelled.",
        counterpart
    )
}

/// Local failure (engine refused, MAC mismatch, ...)
pub fn msg_not_concluded(counterpart: &UserId, reason: &str) -> String {
    format!(
        "Cancelled or protocol error: {}. Verification with {} not concluded. Try again?",
        reason, counterpart
    )
}

pub fn msg_verified(counterpart: &UserId, devices: &BTreeSet<DeviceId>) -> String {
    let devices: Vec<&str> = devices.iter().map(|d| d.0.as_str()).collect();
    format!(
        "Emoji verification with {} was successful! Verified devices: {}",
        counterpart,
        devices.join(", ")
    )
}

/// Text shown at the decision point
pub fn msg_decision_prompt(request: &DecisionRequest) -> String {
    let mut msg = format!(
        "🔐 Emoji verification with {} (transaction {})\n\n",
        request.counterpart, request.transaction_id
    );

    for symbol in request.short_auth_string.symbols() {
        msg.push_str(&format!("  {}  {}\n", symbol.emoji, symbol.description));
    }

    msg.push_str("\nDo the emojis match? (Y/N) (C for Cancel) ");
    msg
}
