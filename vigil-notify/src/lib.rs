//! Best-effort Telegram sink.
//!
//! Messages go through a bounded mailbox drained by a single worker that
//! paces sends and chunks long texts. Delivery failures are logged and
//! dropped; nothing in here may ever stall trading.

use std::time::Duration;

use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vigil_config::TelegramConfig;
use vigil_core::{ExitReason, Position, Side, TradeRecord};

/// Telegram hard-caps message length at 4096 characters.
const CHUNK_LIMIT: usize = 4_096;
/// Two messages per second keeps us inside the bot API limits.
const SEND_SPACING: Duration = Duration::from_millis(500);
const MAILBOX_CAPACITY: usize = 256;

/// Cheap clonable handle for enqueueing notifications.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<String>>,
}

impl Notifier {
    /// Start the delivery worker. With `enabled = false` (or missing
    /// credentials) the handle silently swallows everything, which is what
    /// dry runs want.
    pub fn spawn(config: TelegramConfig) -> (Self, Option<JoinHandle<()>>) {
        if !config.enabled || config.bot_token.is_empty() || config.chat_id.is_empty() {
            debug!("telegram notifications disabled");
            return (Self { tx: None }, None);
        }
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = tokio::spawn(deliver_loop(config, rx));
        (Self { tx: Some(tx) }, Some(worker))
    }

    /// A notifier that drops everything. For tests and dry runs.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Enqueue a message. Never blocks: when the mailbox is full the message
    /// is dropped with a log line.
    pub fn send(&self, text: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(text.into()) {
            warn!(error = %err, "notification mailbox full, dropping message");
        }
    }
}

async fn deliver_loop(config: TelegramConfig, mut rx: mpsc::Receiver<String>) {
    let client = match Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "failed to build telegram client, notifications disabled");
            return;
        }
    };
    let url = format!("https://api.telegram.org/bot{}/sendMessage", config.bot_token);
    while let Some(message) = rx.recv().await {
        for chunk in chunk_message(&message) {
            let payload = json!({ "chat_id": config.chat_id, "text": chunk });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), "telegram rejected notification");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "telegram delivery failed"),
            }
            tokio::time::sleep(SEND_SPACING).await;
        }
    }
}

/// Split on line boundaries where possible, hard-split otherwise.
fn chunk_message(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_LIMIT {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > CHUNK_LIMIT && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > CHUNK_LIMIT {
            let mut rest = line;
            while rest.len() > CHUNK_LIMIT {
                let split = floor_char_boundary(rest, CHUNK_LIMIT);
                chunks.push(rest[..split].to_string());
                rest = &rest[split..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut idx = index.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ---------------------------------------------------------------------------
// Message catalogue
// ---------------------------------------------------------------------------

fn mode_label(dry_run: bool) -> &'static str {
    if dry_run {
        "TEST"
    } else {
        "LIVE"
    }
}

/// Entry order accepted (pending limit or filled market).
#[must_use]
pub fn format_order_placed(position: &Position, venue: &str, dry_run: bool) -> String {
    let status = match position.status {
        vigil_core::PositionStatus::Pending => "PENDING",
        _ => "FILLED",
    };
    format!(
        "{} | {} | {}\n{} {} x{} {}\nEntry: {}\nSL: {} | TP: {}",
        mode_label(dry_run),
        venue.to_uppercase(),
        status,
        position.symbol,
        position.side,
        position.leverage,
        position.timeframe,
        position.entry_price,
        position.sl_price,
        position.tp_price,
    )
}

/// Pending limit order filled.
#[must_use]
pub fn format_position_filled(position: &Position, venue: &str, dry_run: bool) -> String {
    format!(
        "{} | {} | FILLED\n{} {} x{} @ {}\nQty: {} | Notional: {}\nSL: {} | TP: {}",
        mode_label(dry_run),
        venue.to_uppercase(),
        position.symbol,
        position.side,
        position.leverage,
        position.entry_price,
        position.qty,
        position.notional(),
        position.sl_price,
        position.tp_price,
    )
}

/// Pending entry cancelled before fill.
#[must_use]
pub fn format_order_cancelled(position: &Position, venue: &str, reason: &str, dry_run: bool) -> String {
    format!(
        "{} | {} | CANCELLED\n{} {} @ {}\nReason: {reason}",
        mode_label(dry_run),
        venue.to_uppercase(),
        position.symbol,
        position.side,
        position.entry_price,
    )
}

/// Position closed with a realized result.
#[must_use]
pub fn format_position_closed(trade: &TradeRecord, venue: &str, dry_run: bool) -> String {
    let icon = if trade.pnl >= Decimal::ZERO { "+" } else { "" };
    format!(
        "{} | {} | CLOSED ({})\n{} {}\nEntry: {} -> Exit: {}\nPnL: {icon}{} USDT (fees {})",
        mode_label(dry_run),
        venue.to_uppercase(),
        trade.exit_reason,
        trade.symbol,
        trade.side,
        trade.entry_price,
        trade.exit_price,
        trade.pnl,
        trade.fees,
    )
}

/// Stray venue position brought under management.
#[must_use]
pub fn format_position_adopted(position: &Position, venue: &str) -> String {
    format!(
        "{} | ADOPTED\n{} {} qty {} @ {}\nSL: {} | TP: {}",
        venue.to_uppercase(),
        position.symbol,
        position.side,
        position.qty,
        position.entry_price,
        position.sl_price,
        position.tp_price,
    )
}

/// Circuit breaker tripped; new entries frozen.
#[must_use]
pub fn format_circuit_breaker(venue: &str, reason: &str) -> String {
    format!("CIRCUIT BREAKER | {}\n{reason}\nNew entries frozen until operator resume.", venue.to_uppercase())
}

/// Periodic portfolio summary.
#[must_use]
pub fn format_status_report(
    venue: &str,
    active: &[(Position, Decimal)],
    pending: &[Position],
) -> Option<String> {
    if active.is_empty() && pending.is_empty() {
        return None;
    }
    let mut sections = vec![format!("PORTFOLIO UPDATE | {}", venue.to_uppercase())];
    if !active.is_empty() {
        sections.push("Active:".into());
        let mut total = Decimal::ZERO;
        for (position, pnl) in active {
            total += *pnl;
            sections.push(format!(
                "  {} {} x{} @ {} | PnL {} | SL {} TP {}",
                position.symbol,
                position.side,
                position.leverage,
                position.entry_price,
                pnl,
                position.sl_price,
                position.tp_price,
            ));
        }
        sections.push(format!("Total PnL: {total} USDT"));
    }
    if !pending.is_empty() {
        sections.push("Pending:".into());
        for position in pending {
            sections.push(format!(
                "  {} {} @ {} | qty {}",
                position.symbol, position.side, position.entry_price, position.qty,
            ));
        }
    }
    Some(sections.join("\n"))
}

/// Flip exit followed by a reduced-size re-entry.
#[must_use]
pub fn format_starter_reversal(symbol: &str, from: Side, to: Side, reason: &ExitReason) -> String {
    format!("REVERSAL | {symbol}\nClosed {from} ({reason}), opening starter {to}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_stay_whole() {
        assert_eq!(chunk_message("hello").len(), 1);
    }

    #[test]
    fn long_messages_split_under_limit() {
        let line = "x".repeat(1_000);
        let text = (0..10).map(|_| line.clone()).collect::<Vec<_>>().join("\n");
        let chunks = chunk_message(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.len() <= CHUNK_LIMIT));
        let total: usize = chunks.iter().map(String::len).sum();
        assert_eq!(total, text.len());
    }

    #[test]
    fn oversized_single_line_hard_splits() {
        let text = "y".repeat(CHUNK_LIMIT * 2 + 10);
        let chunks = chunk_message(&text);
        assert!(chunks.iter().all(|chunk| chunk.len() <= CHUNK_LIMIT));
        let total: usize = chunks.iter().map(String::len).sum();
        assert_eq!(total, text.len());
    }

    #[test]
    fn disabled_notifier_swallows_sends() {
        let notifier = Notifier::disabled();
        notifier.send("ignored");
    }
}
