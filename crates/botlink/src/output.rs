use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use botlink_frame::types::type_name;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One received message, as printed by `serve` and `send --wait-type`.
#[derive(Debug, Clone, Copy)]
pub struct Received<'a> {
    pub from: &'a str,
    pub type_id: u8,
    pub sequence: Option<u16>,
    pub payload: &'a [u8],
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    from: &'a str,
    type_id: u8,
    type_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u16>,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_message(message: Received<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                from: message.from,
                type_id: message.type_id,
                type_name: type_name(message.type_id),
                sequence: message.sequence,
                payload_size: message.payload.len(),
                payload: payload_preview(message.payload),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FROM", "TYPE", "SEQ", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    message.from.to_string(),
                    format!("{:#04x} {}", message.type_id, type_name(message.type_id)),
                    message
                        .sequence
                        .map_or_else(|| "-".to_string(), |s| s.to_string()),
                    message.payload.len().to_string(),
                    payload_preview(message.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "from={} type={:#04x} ({}) size={} payload={}",
                message.from,
                message.type_id,
                type_name(message.type_id),
                message.payload.len(),
                payload_preview(message.payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(message.payload);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
