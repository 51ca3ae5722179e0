use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use saturday_utils::{serialize_duration_option, to_duration, Bytesize};

use crate::scram::HashAlgorithm;
use crate::{Error, Result};

/// Unit of a bare integer `max_message_bytes`
pub const MB: usize = 1 << 20;

/// The broker client's own default for `message.max.bytes`
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;

/// Payloads above this size are reported even when below the configured ceiling
pub const WARNING_MESSAGE_SIZE: usize = 1024 * 1024;

const ENV_PREFIX: &str = "saturday_kafka";

#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub group: String,
    #[serde(default, alias = "groupId")]
    pub group_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// `"4M"`, `"512K"`, or a bare integer counted in megabytes
    #[serde(
        default,
        alias = "maxMessageBytes",
        deserialize_with = "BrokerConfig::deserialize_max_message_bytes"
    )]
    pub max_message_bytes: Option<Bytesize>,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub newest: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub consumer: ConsumerTuning,
    #[serde(default)]
    pub acl: Acl,
    /// Passed to the broker client after everything else, `#` prefixed keys are skipped
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl BrokerConfig {
    pub fn new<A: Into<String>>(addrs: impl IntoIterator<Item = A>) -> Self {
        Self { addrs: addrs.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    /// Load from an optional file `name` (any format the `config` crate detects by
    /// extension) overlaid by `SATURDAY_KAFKA__*` environment variables, e.g.
    /// `SATURDAY_KAFKA__ADDRS="10.0.0.1:9092,10.0.0.2:9092"`.
    pub fn load(name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(name) = name {
            builder = builder.add_source(File::with_name(name).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("addrs")
                .with_list_parse_key("topics"),
        );
        let cfg: BrokerConfig = builder.build()?.try_deserialize()?;
        Ok(cfg)
    }

    /// Checks required for a live connection. Constructors call this, plain data use
    /// does not.
    pub fn validate(&self) -> Result<()> {
        if self.addrs.iter().all(|a| a.trim().is_empty()) {
            return Err(Error::InvalidConfig("addrs is empty".into()));
        }
        if self.acl.enable && self.acl.user.is_empty() {
            return Err(Error::InvalidConfig("acl is enabled but user is empty".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn bootstrap_servers(&self) -> String {
        self.addrs.iter().map(|a| a.trim()).filter(|a| !a.is_empty()).collect::<Vec<_>>().join(",")
    }

    /// Absolute byte ceiling handed to the broker client and used for size warnings
    #[inline]
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes.map(|b| b.as_usize()).filter(|b| *b > 0).unwrap_or(DEFAULT_MAX_MESSAGE_BYTES)
    }

    #[inline]
    pub fn kafka_version(&self) -> KafkaVersion {
        KafkaVersion::from_str(&self.version).unwrap_or_default()
    }

    #[inline]
    pub fn initial_offset(&self) -> InitialOffset {
        if self.newest {
            InitialOffset::Newest
        } else {
            InitialOffset::Oldest
        }
    }

    /// `properties` without commented-out keys
    pub fn extra_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter(|(k, _)| !k.trim_start().starts_with('#'))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn deserialize_max_message_bytes<'de, D>(deserializer: D) -> std::result::Result<Option<Bytesize>, D::Error>
    where
        D: Deserializer<'de>,
    {
        saturday_utils::deserialize_bytesize_with_unit(deserializer, MB)
    }
}

/// Durations take "5s" / "300ms" strings. Bare integers count seconds for the group
/// timers and milliseconds for `max_processing_time`.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerTuning {
    #[serde(
        default,
        alias = "groupHeartbeatInterval",
        deserialize_with = "deserialize_secs",
        serialize_with = "serialize_duration_option"
    )]
    pub group_heartbeat_interval: Option<Duration>,
    #[serde(
        default,
        alias = "groupSessionTimeout",
        deserialize_with = "deserialize_secs",
        serialize_with = "serialize_duration_option"
    )]
    pub group_session_timeout: Option<Duration>,
    #[serde(
        default,
        alias = "maxProcessingTime",
        deserialize_with = "deserialize_millis",
        serialize_with = "serialize_duration_option"
    )]
    pub max_processing_time: Option<Duration>,
    #[serde(default, alias = "returnErrors")]
    pub return_errors: Option<bool>,
}

impl ConsumerTuning {
    #[inline]
    fn heartbeat_interval_default() -> Duration {
        Duration::from_secs(5)
    }
    #[inline]
    fn session_timeout_default() -> Duration {
        Duration::from_secs(15)
    }
    #[inline]
    fn max_processing_time_default() -> Duration {
        Duration::from_millis(300)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        non_zero_or(self.group_heartbeat_interval, Self::heartbeat_interval_default())
    }

    #[inline]
    pub fn session_timeout(&self) -> Duration {
        non_zero_or(self.group_session_timeout, Self::session_timeout_default())
    }

    #[inline]
    pub fn max_processing_time(&self) -> Duration {
        non_zero_or(self.max_processing_time, Self::max_processing_time_default())
    }

    #[inline]
    pub fn return_errors(&self) -> bool {
        self.return_errors.unwrap_or(true)
    }
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_with_unit(deserializer, Duration::from_secs(1))
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_with_unit(deserializer, Duration::from_millis(1))
}

fn deserialize_duration_with_unit<'de, D>(
    deserializer: D,
    unit: Duration,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    let times = |n: u64| unit.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX));
    let d = match Option::<Raw>::deserialize(deserializer)? {
        None | Some(Raw::Int(0)) => None,
        Some(Raw::Int(n)) => Some(times(n)),
        Some(Raw::Text(s)) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else if let Ok(n) = s.parse::<u64>() {
                Some(times(n))
            } else {
                let d = to_duration(s).ok_or_else(|| de::Error::custom(format!("invalid duration, {s}")))?;
                Some(d)
            }
        }
    };
    Ok(d)
}

#[inline]
fn non_zero_or(v: Option<Duration>, default: Duration) -> Duration {
    v.filter(|d| !d.is_zero()).unwrap_or(default)
}

#[derive(Default, Clone, Deserialize, Serialize)]
pub struct Acl {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mechanism: HashAlgorithm,
}

impl fmt::Debug for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acl")
            .field("enable", &self.enable)
            .field("user", &self.user)
            .field("password", &"******")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Where a group with no committed offset starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Oldest,
    Newest,
}

impl InitialOffset {
    /// `auto.offset.reset` value
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        }
    }
}

/// Broker protocol version, `major.minor.patch[.build]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KafkaVersion(pub u16, pub u16, pub u16, pub u16);

impl KafkaVersion {
    /// Assumed when the configured version is missing or unparsable
    pub const BASELINE: KafkaVersion = KafkaVersion(2, 1, 0, 0);
}

impl Default for KafkaVersion {
    fn default() -> Self {
        Self::BASELINE
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.3 == 0 {
            write!(f, "{}.{}.{}", self.0, self.1, self.2)
        } else {
            write!(f, "{}.{}.{}.{}", self.0, self.1, self.2, self.3)
        }
    }
}

impl FromStr for KafkaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid kafka version, {s:?}"));
        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u16>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;
        match parts.as_slice() {
            [a, b, c] => Ok(KafkaVersion(*a, *b, *c, 0)),
            [a, b, c, d] => Ok(KafkaVersion(*a, *b, *c, *d)),
            _ => Err(invalid()),
        }
    }
}
