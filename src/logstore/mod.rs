//! Chat Log Store (§4.6): append-only per-day text logs, one file per
//! account/room/day, with sanitized path components, duplicate-line
//! suppression, and a restart reader that reconstructs recent history.
//!
//! Writes are serialized through a single worker task fed over an
//! `mpsc` channel — the same worker-task idiom the teacher uses for its
//! XMPP read/write tasks in `xmpp/client.rs::run_event_loop`, applied
//! here to disk I/O instead of a socket.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::{ChatMessage, MessageKind};

const RESTART_READ_DAYS: u32 = 7;
const RESTART_READ_LIMIT: usize = 100;

/// Sanitizes one path component (`<account>` or `<room>`) per §4.6:
/// strips control chars and DEL, replaces path separators, collapses
/// `..`, escapes a leading dot, and bounds the length.
pub fn sanitize_path_component(raw: &str) -> String {
    let mut s: String = raw
        .chars()
        .filter(|c| {
            let code = *c as u32;
            !(code <= 0x1F || code == 0x7F)
        })
        .collect();
    s = s.replace(['/', '\\'], "_");
    s = s.replace("..", "__");
    if s.starts_with('.') {
        s = format!("_{s}");
    }
    if s.chars().count() > 200 {
        s = s.chars().take(200).collect();
    }
    if s.is_empty() {
        s = "_unknown".to_string();
    }
    s
}

/// `DM-<nick>`, nick sanitized first.
pub fn dm_room_name(nick: &str) -> String {
    format!("DM-{}", sanitize_path_component(nick))
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap())
        .format("%H:%M:%S")
        .to_string()
}

/// Renders one `ChatMessage` to its day-file line, per §4.6's per-kind
/// formats, prefixed `[HH:MM:SS] `.
pub fn format_line(msg: &ChatMessage) -> String {
    let rendered = match msg.kind {
        MessageKind::Chat => format!("{} {}", msg.sender, msg.body),
        MessageKind::Action => format!("* {} {}", msg.sender, msg.body),
        MessageKind::Join => format!("→ {} has joined", msg.sender),
        MessageKind::Part if msg.body.is_empty() => format!("← {} has left", msg.sender),
        MessageKind::Part => format!("← {} has left ({})", msg.sender, msg.body),
        MessageKind::Quit if msg.body.is_empty() => format!("⇐ {} has quit", msg.sender),
        MessageKind::Quit => format!("⇐ {} has quit ({})", msg.sender, msg.body),
        MessageKind::Topic => format!("✦ {} changed the topic to: {}", msg.sender, msg.body),
        MessageKind::System => format!("• {}", msg.body),
    };
    format!("[{}] {rendered}", format_time(msg.timestamp))
}

fn day_file_path(root: &Path, account: &str, room: &str, date: NaiveDate) -> PathBuf {
    root.join("logs")
        .join(sanitize_path_component(account))
        .join(sanitize_path_component(room))
        .join(format!("{}.txt", date.format("%Y-%m-%d")))
}

async fn append_to_disk(root: &Path, account: &str, room: &str, message: &ChatMessage) -> anyhow::Result<()> {
    let date = chrono::DateTime::from_timestamp(message.timestamp, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_else(|| chrono::Utc::now().date_naive());
    let path = day_file_path(root, account, room, date);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let line = format_line(message);
    let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    if existing.contains(&line) {
        return Ok(());
    }

    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

struct AppendJob {
    account: String,
    room: String,
    message: ChatMessage,
}

/// Handle to the log store. Cheap to clone-construct per account; the
/// background worker serializes all writes across every `append` call.
pub struct LogStore {
    root: PathBuf,
    tx: mpsc::UnboundedSender<AppendJob>,
}

impl LogStore {
    pub fn new(data_root: &Path) -> Self {
        let root = data_root.to_path_buf();
        let (tx, mut rx) = mpsc::unbounded_channel::<AppendJob>();
        let worker_root = root.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = append_to_disk(&worker_root, &job.account, &job.room, &job.message).await {
                    warn!("chat log append failed for {}/{}: {e}", job.account, job.room);
                }
            }
        });
        LogStore { root, tx }
    }

    /// Enqueues `message` for `account`/`room`. Fire-and-forget — a
    /// failed append is logged by the worker, never surfaced to the caller.
    pub fn append(&self, account: &str, room: &str, message: ChatMessage) {
        let _ = self.tx.send(AppendJob {
            account: account.to_string(),
            room: room.to_string(),
            message,
        });
    }

    pub async fn load_recent_history(&self, account: &str, room: &str) -> anyhow::Result<Vec<ChatMessage>> {
        load_recent_history(&self.root, account, room, RESTART_READ_DAYS, RESTART_READ_LIMIT).await
    }
}

fn push_parsed(out: &mut Vec<ChatMessage>, date: NaiveDate, time: NaiveTime, sender: &str, body: &str, kind: MessageKind) {
    let dt = NaiveDateTime::new(date, time);
    out.push(ChatMessage {
        timestamp: dt.and_utc().timestamp(),
        sender: sender.to_string(),
        body: body.to_string(),
        kind,
    });
}

/// Parses one day file's lines into `ChatMessage`s. Only `chat` and
/// `action` lines are reconstructed; the other kinds are recognized by
/// their marker glyph and dropped. A line that is not bracket-leading is
/// a continuation of the previous parsed message's body.
fn parse_day_file(content: &str, date: NaiveDate, out: &mut Vec<ChatMessage>) {
    for line in content.lines() {
        if !line.starts_with('[') {
            if let Some(last) = out.last_mut() {
                last.body.push('\n');
                last.body.push_str(line);
            }
            continue;
        }
        let Some(close) = line.find(']') else { continue };
        let Ok(time) = NaiveTime::parse_from_str(&line[1..close], "%H:%M:%S") else { continue };
        let after = line[close + 1..].trim_start();

        if let Some(rest) = after.strip_prefix("* ") {
            if let Some((sender, body)) = rest.split_once(' ') {
                push_parsed(out, date, time, sender, body, MessageKind::Action);
            }
        } else if after.starts_with(['→', '←', '⇐', '✦', '•']) {
            // join/part/quit/topic/system: not reconstructed (§4.6)
        } else if let Some((sender, body)) = after.split_once(' ') {
            push_parsed(out, date, time, sender, body, MessageKind::Chat);
        }
    }
}

/// `loadRecentHistory(account, room, days, limit)`: enumerates the
/// `days` most recent date files in chronological order, parses them,
/// and returns the last `limit` messages.
pub async fn load_recent_history(
    root: &Path,
    account: &str,
    room: &str,
    days: u32,
    limit: usize,
) -> anyhow::Result<Vec<ChatMessage>> {
    let dir = root
        .join("logs")
        .join(sanitize_path_component(account))
        .join(sanitize_path_component(room));

    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dated_files = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(date_str) = name.strip_suffix(".txt") {
            if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
                dated_files.push((date, entry.path()));
            }
        }
    }
    dated_files.sort_by_key(|(date, _)| *date);
    let cutoff = dated_files.len().saturating_sub(days as usize);

    let mut messages = Vec::new();
    for (date, path) in &dated_files[cutoff..] {
        let content = tokio::fs::read_to_string(path).await?;
        parse_day_file(&content, *date, &mut messages);
    }

    let start = messages.len().saturating_sub(limit);
    Ok(messages[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ts: i64, sender: &str, body: &str, kind: MessageKind) -> ChatMessage {
        ChatMessage { timestamp: ts, sender: sender.to_string(), body: body.to_string(), kind }
    }

    #[test]
    fn sanitizes_control_chars_slashes_and_dotdot() {
        assert_eq!(sanitize_path_component("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_path_component("../../etc"), "____etc");
        assert_eq!(sanitize_path_component("a\x01\x7fb"), "ab");
    }

    #[test]
    fn prefixes_leading_dot_and_handles_empty() {
        assert_eq!(sanitize_path_component(".hidden"), "_.hidden");
        assert_eq!(sanitize_path_component(""), "_unknown");
        assert_eq!(sanitize_path_component("\x01\x02"), "_unknown");
    }

    #[test]
    fn truncates_to_200_chars() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_path_component(&long).chars().count(), 200);
    }

    #[test]
    fn dm_room_name_sanitizes_nick_first() {
        assert_eq!(dm_room_name("bob/evil"), "DM-bob_evil");
    }

    #[test]
    fn format_line_covers_all_seven_kinds() {
        assert_eq!(format_line(&msg(0, "alice", "hi", MessageKind::Chat)), "[00:00:00] alice hi");
        assert_eq!(format_line(&msg(0, "alice", "waves", MessageKind::Action)), "[00:00:00] * alice waves");
        assert_eq!(format_line(&msg(0, "alice", "", MessageKind::Join)), "[00:00:00] → alice has joined");
        assert_eq!(format_line(&msg(0, "alice", "", MessageKind::Part)), "[00:00:00] ← alice has left");
        assert_eq!(format_line(&msg(0, "alice", "brb", MessageKind::Part)), "[00:00:00] ← alice has left (brb)");
        assert_eq!(format_line(&msg(0, "alice", "", MessageKind::Quit)), "[00:00:00] ⇐ alice has quit");
        assert_eq!(format_line(&msg(0, "alice", "bye", MessageKind::Quit)), "[00:00:00] ⇐ alice has quit (bye)");
        assert_eq!(format_line(&msg(0, "alice", "lunch", MessageKind::Topic)), "[00:00:00] ✦ alice changed the topic to: lunch");
        assert_eq!(format_line(&msg(0, "", "server restarting", MessageKind::System)), "[00:00:00] • server restarting");
    }

    #[tokio::test]
    async fn append_then_load_recent_history_round_trips_chat_and_action() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LogStore::new(tmp.path());
        store.append("alice@example.org", "room@muc.example.org", msg(1_700_000_000, "bob", "hello", MessageKind::Chat));
        store.append("alice@example.org", "room@muc.example.org", msg(1_700_000_001, "bob", "waves", MessageKind::Action));
        store.append("alice@example.org", "room@muc.example.org", msg(1_700_000_002, "bob", "", MessageKind::Join));
        // give the worker a moment to drain
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let history = store.load_recent_history("alice@example.org", "room@muc.example.org").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, MessageKind::Chat);
        assert_eq!(history[0].body, "hello");
        assert_eq!(history[1].kind, MessageKind::Action);
    }

    #[test]
    fn parse_day_file_continues_multiline_bodies() {
        let content = "[10:00:00] alice first line\nsecond line\n[10:00:01] bob reply\n";
        let mut out = Vec::new();
        parse_day_file(content, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].body, "first line\nsecond line");
        assert_eq!(out[1].body, "reply");
    }

    #[test]
    fn parse_day_file_skips_unreconstructed_kinds() {
        let content = "[10:00:00] → alice has joined\n[10:00:01] ✦ alice changed the topic to: lunch\n[10:00:02] alice hi\n";
        let mut out = Vec::new();
        parse_day_file(content, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sender, "alice");
        assert_eq!(out[0].body, "hi");
    }

    #[tokio::test]
    async fn duplicate_line_is_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let m = msg(1_700_000_000, "bob", "hello", MessageKind::Chat);
        append_to_disk(tmp.path(), "acct", "room", &m).await.unwrap();
        append_to_disk(tmp.path(), "acct", "room", &m).await.unwrap();

        let path = day_file_path(tmp.path(), "acct", "room", chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap().date_naive());
        let content = tokio::fs::read_to_string(path).await.unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
