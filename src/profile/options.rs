use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::decode_b64;
use crate::error::{Error, Result};
use crate::proxy::link::check_link;

pub const SPEED_ONLY: &str = "speedonly";
pub const PING_ONLY: &str = "pingonly";

pub const ALLTEST: i32 = 2;
pub const RETEST: i32 = 3;

const DEFAULT_GROUP: &str = "Default";
const EMPTY_GROUP: &str = "?empty?";
/// Floor for timeouts typed by a user in the `^`-separated form and for retests.
const MIN_TIMEOUT: Duration = Duration::from_secs(20);
const MIN_JSON_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    PicBase64,
    PicPath,
    PicNone,
    Json,
    Text,
}

impl OutputMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => OutputMode::PicBase64,
            1 => OutputMode::PicPath,
            3 => OutputMode::Json,
            4 => OutputMode::Text,
            _ => OutputMode::PicNone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMethod {
    Speed,
    RSpeed,
    Ping,
    RPing,
    None,
}

impl SortMethod {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "speed" => SortMethod::Speed,
            "rspeed" => SortMethod::RSpeed,
            "ping" => SortMethod::Ping,
            "rping" => SortMethod::RPing,
            _ => SortMethod::None,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(d)?;
        Ok(Duration::from_secs(secs.max(0) as u64))
    }
}

/// Knobs of one benchmark batch. Field names follow the JSON the web
/// front-end sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileTestOptions {
    #[serde(rename = "group")]
    pub group_name: String,
    /// `all`, `pingonly` or `speedonly`.
    #[serde(rename = "speedtestMode")]
    pub speed_test_mode: String,
    pub ping_method: String,
    pub sort_method: String,
    pub concurrency: i64,
    pub test_mode: i32,
    #[serde(rename = "testids", skip_serializing_if = "Vec::is_empty")]
    pub test_ids: Vec<usize>,
    #[serde(with = "seconds")]
    pub timeout: Duration,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    pub subscription: String,
    pub language: String,
    pub font_size: i32,
    pub theme: String,
    pub unique: bool,
    pub generate_pic_mode: i32,
    pub output_mode: i32,
}

impl Default for ProfileTestOptions {
    fn default() -> Self {
        ProfileTestOptions {
            group_name: DEFAULT_GROUP.into(),
            speed_test_mode: "all".into(),
            ping_method: "googleping".into(),
            sort_method: "rspeed".into(),
            concurrency: 2,
            test_mode: ALLTEST,
            test_ids: Vec::new(),
            timeout: MIN_TIMEOUT,
            links: Vec::new(),
            subscription: String::new(),
            language: "en".into(),
            font_size: 24,
            theme: "rainbow".into(),
            unique: true,
            generate_pic_mode: 0,
            output_mode: 2,
        }
    }
}

impl ProfileTestOptions {
    pub fn speed_only(&self) -> bool {
        self.speed_test_mode == SPEED_ONLY
    }

    pub fn ping_only(&self) -> bool {
        self.speed_test_mode == PING_ONLY
    }

    pub fn sort(&self) -> SortMethod {
        SortMethod::from_name(&self.sort_method)
    }

    pub fn output(&self) -> OutputMode {
        OutputMode::from_code(self.output_mode)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1) as usize
    }

    /// Applies the defaults user input may leave out.
    pub fn normalize(&mut self, min_timeout: Duration) {
        if self.group_name.is_empty() || self.group_name == EMPTY_GROUP {
            self.group_name = DEFAULT_GROUP.into();
        }
        if self.concurrency < 1 {
            self.concurrency = 1;
        }
        if self.timeout < min_timeout {
            self.timeout = min_timeout;
        }
    }

    /// JSON form. A retest carries its links inline; otherwise they are
    /// read from `subscription`.
    pub fn from_json(data: &[u8]) -> Result<(Vec<String>, Self)> {
        let mut options: ProfileTestOptions = serde_json::from_slice(data)
            .map_err(|e| Error::Config(format!("invalid test options: {}", e)))?;
        if options.test_mode == RETEST {
            options.normalize(MIN_TIMEOUT);
            return Ok((options.links.clone(), options));
        }
        options.normalize(MIN_JSON_TIMEOUT);
        options.test_mode = ALLTEST;
        let links = parse_links(&options.subscription);
        Ok((links, options))
    }

    /// `group^speedtestMode^pingMethod^sortMethod^unused^concurrency^timeout`.
    pub fn parse(message: &str) -> Result<Self> {
        let opts: Vec<&str> = message.split('^').collect();
        if opts.len() < 7 {
            return Err(Error::Config("invalid data".into()));
        }
        let concurrency = opts[5]
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::Config(format!("concurrency {:?}: {}", opts[5], e)))?;
        let timeout = opts[6]
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::Config(format!("timeout {:?}: {}", opts[6], e)))?;
        let mut options = ProfileTestOptions {
            group_name: opts[0].to_string(),
            speed_test_mode: opts[1].to_string(),
            ping_method: opts[2].to_string(),
            sort_method: opts[3].to_string(),
            concurrency,
            test_mode: ALLTEST,
            timeout: Duration::from_secs(timeout.max(0) as u64),
            ..Default::default()
        };
        options.normalize(MIN_TIMEOUT);
        Ok(options)
    }
}

/// Pulls descriptor links out of free text: whitespace separated, or one
/// base64 blob of such text.
pub fn parse_links(text: &str) -> Vec<String> {
    let decoded = if text.contains("://") {
        None
    } else {
        decode_b64(text).and_then(|b| String::from_utf8(b).ok())
    };
    decoded
        .as_deref()
        .unwrap_or(text)
        .split_whitespace()
        .filter(|l| check_link(l).is_ok())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::encode_b64;

    #[test]
    fn json_is_coerced() {
        let (links, opts) = ProfileTestOptions::from_json(
            br#"{"group":"?empty?","speedtestMode":"pingonly","sortMethod":"rping",
                 "concurrency":0,"timeout":3,"subscription":"trojan://p@h:443 junk ss://abc"}"#,
        )
        .unwrap();
        assert_eq!(opts.group_name, "Default");
        assert_eq!(opts.concurrency(), 1);
        assert_eq!(opts.timeout, Duration::from_secs(8));
        assert!(opts.ping_only());
        assert_eq!(opts.sort(), SortMethod::RPing);
        assert_eq!(opts.test_mode, ALLTEST);
        assert_eq!(links, vec!["trojan://p@h:443", "ss://abc"]);
    }

    #[test]
    fn retest_keeps_inline_links() {
        let (links, opts) = ProfileTestOptions::from_json(
            br#"{"testMode":3,"links":["vmess://x"],"timeout":5,"concurrency":4}"#,
        )
        .unwrap();
        assert_eq!(links, vec!["vmess://x"]);
        assert_eq!(opts.timeout, MIN_TIMEOUT);
        assert_eq!(opts.concurrency(), 4);
    }

    #[test]
    fn caret_form() {
        let opts = ProfileTestOptions::parse("Group^all^googleping^speed^x^-3^10").unwrap();
        assert_eq!(opts.group_name, "Group");
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.timeout, Duration::from_secs(20));
        assert_eq!(opts.sort(), SortMethod::Speed);
        assert!(ProfileTestOptions::parse("a^b").is_err());
        assert!(ProfileTestOptions::parse("a^b^c^d^e^many^10").is_err());
    }

    #[test]
    fn links_from_base64_blob() {
        let blob = encode_b64(b"trojan://p@h:443\nhttp://proxy:8080\n");
        assert_eq!(parse_links(&blob), vec!["trojan://p@h:443", "http://proxy:8080"]);
    }

    #[test]
    fn output_codes() {
        assert_eq!(OutputMode::from_code(3), OutputMode::Json);
        assert_eq!(OutputMode::from_code(4), OutputMode::Text);
        assert_eq!(OutputMode::from_code(9), OutputMode::PicNone);
    }
}
