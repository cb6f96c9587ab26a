use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::download::byte_count_iec;
use crate::proxy::link::link_info;
use crate::proxy::outbound::host_port;

pub const SPEEDTEST_ERROR_NONODES: &str = "{\"info\":\"error\",\"reason\":\"nonodes\"}\n";

/// One progress event, serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub info: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remarks: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub ping: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub lost: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub speed: String,
    #[serde(rename = "maxspeed", skip_serializing_if = "String::is_empty")]
    pub max_speed: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub traffic: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(rename = "data", skip_serializing_if = "String::is_empty")]
    pub pic_data: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Message>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn speed_label(v: i64) -> String {
    if v < 1 {
        return "N/A".into();
    }
    let s = byte_count_iec(v);
    s.strip_suffix("/s").map(str::to_string).unwrap_or(s)
}

/// `vmess/ws` when a transport is set on vmess or trojan links.
pub fn protocol_label(protocol: &str, net: &str) -> String {
    if (protocol == "vmess" || protocol == "trojan") && !net.is_empty() {
        format!("{}/{}", protocol, net)
    } else {
        protocol.to_string()
    }
}

impl Message {
    pub fn new(id: i64, info: &str) -> Self {
        Message {
            id,
            info: info.to_string(),
            ..Default::default()
        }
    }

    pub fn gotping(id: i64, ping: i64) -> Self {
        Message {
            ping,
            lost: "0.00%".into(),
            ..Self::new(id, "gotping")
        }
    }

    /// `speed`/`maxspeed` render as `N/A` below one byte per second.
    pub fn gotspeed(id: i64, speed: i64, max_speed: i64, traffic: i64) -> Self {
        Message {
            speed: speed_label(speed),
            max_speed: speed_label(max_speed),
            traffic,
            ..Self::new(id, "gotspeed")
        }
    }

    pub fn picdata(data: &str) -> Self {
        Message {
            pic_data: data.to_string(),
            ..Self::new(-1, "picdata")
        }
    }

    pub fn eof(duration: &str) -> Self {
        Message {
            pic_data: duration.to_string(),
            ..Self::new(-1, "eof")
        }
    }

    /// Display row for one link. Fields stay empty when the link does not parse.
    pub fn gotserver(id: i64, link: &str, group: &str) -> Self {
        let mut msg = Self::new(id, "gotserver");
        if let Ok(info) = link_info(link) {
            msg.group = group.to_string();
            msg.server = host_port(&info.server, info.port);
            msg.protocol = protocol_label(&info.protocol, &info.net);
            msg.remarks = info.remarks;
            msg.link = link.to_string();
        }
        msg
    }

    pub fn gotservers(start: usize, links: &[String], group: &str) -> Self {
        Message {
            servers: links
                .iter()
                .enumerate()
                .map(|(i, link)| Self::gotserver((start + i) as i64, link, group))
                .collect(),
            ..Self::new(start as i64, "gotservers")
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // plain strings and integers always serialize
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Sink for progress events.
pub trait MessageWriter: Send + Sync {
    fn write_message(&self, data: &[u8]) -> io::Result<()>;
}

/// One JSON object per line on stdout.
#[derive(Default)]
pub struct StdoutWriter {
    lock: Mutex<()>,
}

impl MessageWriter for StdoutWriter {
    fn write_message(&self, data: &[u8]) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        if !data.ends_with(b"\n") {
            out.write_all(b"\n")?;
        }
        out.flush()
    }
}

pub struct EmptyWriter;

impl MessageWriter for EmptyWriter {
    fn write_message(&self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Forwards raw events to a channel.
pub struct ChannelWriter(pub mpsc::UnboundedSender<Vec<u8>>);

impl MessageWriter for ChannelWriter {
    fn write_message(&self, data: &[u8]) -> io::Result<()> {
        self.0
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "message receiver dropped"))
    }
}
