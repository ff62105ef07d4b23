//! Agent configuration
//!
//! [`AgentConfig`] collects every knob the engine recognises: the RFC 3261
//! timer base values, size limits, rport and 100rel policy, DNS behaviour
//! and the tuning constants of the scheduler.
//!
//! ## Timer values
//!
//! | Field   | Default | Drives                                       |
//! |---------|---------|----------------------------------------------|
//! | `t1`    | 500 ms  | A, E, G, P1 start interval                   |
//! | `t2`    | 4 s     | E and G cap, auto-100 delay                  |
//! | `t4`    | 5 s     | K, I linger on unreliable transports         |
//! | `t1x64` | 32 s    | B, F, H, J, P2, D                            |
//! | `timer_c` | 185 s | INVITE proceeding timeout                    |
//!
//! Durations serialize as milliseconds, so a JSON document such as
//! `{"t1": 250, "t2": 2000}` overrides only the timers it names.
//!
//! ## Examples
//!
//! ```rust
//! use std::time::Duration;
//! use siptx_transaction_core::config::AgentConfig;
//!
//! let config = AgentConfig::default()
//!     .with_t1(Duration::from_millis(250))
//!     .with_user_agent(true)
//!     .with_rel100(true);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.t1x64, Duration::from_millis(250 * 64));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use siptx_sip_core::Uri;
use siptx_sip_resolver::{IpFamilyOrder, ResolverConfig};
use siptx_sip_transport::TransportKind;

use crate::error::{Error, Result};

/// How `rport` (RFC 3581) is applied to requests received over UDP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRport {
    /// Never fill in `rport`
    Off,
    /// Fill in `rport` when the client asked for it
    #[default]
    Use,
    /// Always answer to the source port, as if `rport` had been requested
    Always,
}

/// Configuration of an [`Agent`](crate::Agent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Round-trip time estimate
    #[serde(with = "duration_ms")]
    pub t1: Duration,
    /// Retransmission interval cap for non-INVITE requests and INVITE responses
    #[serde(with = "duration_ms")]
    pub t2: Duration,
    /// Maximum time a message stays in the network
    #[serde(with = "duration_ms")]
    pub t4: Duration,
    /// Transaction timeout, normally 64 * T1
    #[serde(with = "duration_ms")]
    pub t1x64: Duration,

    /// Largest message accepted from the network
    pub max_size: usize,
    /// Server transactions allowed to wait for a final response at once
    pub max_proceeding: usize,
    /// Max-Forwards inserted into requests that lack one
    pub max_forwards: u32,
    /// Requests larger than this are sent over a reliable transport
    pub udp_mtu: usize,
    /// Interval for re-sending the latest provisional response to INVITE
    #[serde(with = "duration_ms")]
    pub progress: Duration,
    /// INVITE proceeding timeout; `None` disables timer C
    #[serde(with = "opt_duration_ms")]
    pub timer_c: Option<Duration>,

    /// Seconds a failed SRV target stays graylisted
    pub graylist: u32,
    /// Retry-After seconds on locally generated errors; 0 omits the header
    pub blacklist: u32,
    /// Packets dropped per thousand on unreliable transports
    pub debug_drop_prob: u32,

    /// Deliver requests without creating server transactions
    pub stateless: bool,
    /// Act as a user agent (dialog checks, 482 on merged requests, orphan BYE)
    pub ua: bool,
    /// Send reliable provisional responses when the client supports 100rel
    pub rel100: bool,

    /// Add `rport` to the Via of outgoing requests
    pub client_rport: bool,
    pub server_rport: ServerRport,
    /// Apply the rport policy on TCP too
    pub tcp_rport: bool,
    /// Apply the rport policy on TLS too
    pub tls_rport: bool,

    pub use_naptr: bool,
    pub use_srv: bool,
    /// Try the next DNS destination when a 503 arrives
    pub srv_503: bool,
    /// Address family preference for A/AAAA lookups
    pub ip_family: IpFamilyOrder,
    /// Transports the agent sends on, in preference order
    pub transports: Vec<TransportKind>,

    /// Add a Timestamp header to outgoing requests
    pub use_timestamp: bool,
    /// Next hop for requests without a Route set
    pub default_proxy: Option<Uri>,
    /// URIs the agent considers its own
    pub aliases: Vec<Uri>,

    /// Send 100 Trying to non-INVITE retransmissions
    pub extra_100: bool,
    /// Fraction of T2 that must elapse before the automatic 100 Trying
    pub extra_100_fraction: f64,
    /// Deliver 100 Trying to the application
    pub pass_100: bool,
    /// Deliver a local 408 when a client transaction times out
    pub timeout_408: bool,
    /// Deliver 408 responses to non-INVITE requests received from the network
    pub pass_408: bool,
    /// Reject merged requests with 482 (requires `ua`)
    pub merge_482: bool,
    /// Answer a canceled INVITE with 487 automatically
    pub cancel_487: bool,
    /// Complete a canceled INVITE locally and send CANCEL at once
    pub cancel_2543: bool,
    /// Tag the To header of responses to every method, not just dialog creating ones
    pub tag_3261: bool,

    /// Added to the highest SRV priority when graylisting a target
    pub graylist_priority_bump: u16,
    /// Upper bound on P1 retransmissions; unlimited until P2 when `None`
    pub reliable_max_retries: Option<u32>,

    /// Retransmissions processed per tick
    pub retransmit_batch: usize,
    /// Expirations processed per queue per tick
    pub timeout_batch: usize,
    /// Terminated transactions released on a blocking worker above this count
    pub bulk_free_threshold: usize,
    /// Seed for the agent's random source
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t1x64: Duration::from_secs(32),
            max_size: 2 * 1024 * 1024,
            max_proceeding: usize::MAX,
            max_forwards: 70,
            udp_mtu: 1300,
            progress: Duration::from_secs(60),
            timer_c: Some(Duration::from_secs(185)),
            graylist: 600,
            blacklist: 0,
            debug_drop_prob: 0,
            stateless: false,
            ua: false,
            rel100: false,
            client_rport: true,
            server_rport: ServerRport::Use,
            tcp_rport: false,
            tls_rport: false,
            use_naptr: true,
            use_srv: true,
            srv_503: true,
            ip_family: IpFamilyOrder::default(),
            transports: vec![TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls],
            use_timestamp: false,
            default_proxy: None,
            aliases: Vec::new(),
            extra_100: false,
            extra_100_fraction: 0.5,
            pass_100: false,
            timeout_408: true,
            pass_408: false,
            merge_482: true,
            cancel_487: true,
            cancel_2543: false,
            tag_3261: true,
            graylist_priority_bump: 1,
            reliable_max_retries: None,
            retransmit_batch: 30,
            timeout_batch: 100,
            bulk_free_threshold: 256,
            seed: None,
        }
    }
}

impl AgentConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AgentConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set T1 and derive T1x64 from it
    pub fn with_t1(mut self, t1: Duration) -> Self {
        self.t1 = t1;
        self.t1x64 = t1 * 64;
        self
    }

    pub fn with_t2(mut self, t2: Duration) -> Self {
        self.t2 = t2;
        self
    }

    pub fn with_t4(mut self, t4: Duration) -> Self {
        self.t4 = t4;
        self
    }

    pub fn with_t1x64(mut self, t1x64: Duration) -> Self {
        self.t1x64 = t1x64;
        self
    }

    pub fn with_timer_c(mut self, timer_c: Option<Duration>) -> Self {
        self.timer_c = timer_c;
        self
    }

    /// User agent mode; timer C is only kept when it was configured explicitly
    ///
    /// # Arguments
    /// * `ua` - Whether the agent terminates dialogs itself
    pub fn with_user_agent(mut self, ua: bool) -> Self {
        if ua && self.timer_c == AgentConfig::default().timer_c {
            self.timer_c = None;
        }
        self.ua = ua;
        self
    }

    pub fn with_rel100(mut self, rel100: bool) -> Self {
        self.rel100 = rel100;
        self
    }

    pub fn with_stateless(mut self, stateless: bool) -> Self {
        self.stateless = stateless;
        self
    }

    pub fn with_server_rport(mut self, rport: ServerRport) -> Self {
        self.server_rport = rport;
        self
    }

    pub fn with_naptr(mut self, use_naptr: bool) -> Self {
        self.use_naptr = use_naptr;
        self
    }

    pub fn with_srv(mut self, use_srv: bool) -> Self {
        self.use_srv = use_srv;
        self
    }

    pub fn with_ip_family(mut self, family: IpFamilyOrder) -> Self {
        self.ip_family = family;
        self
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_default_proxy(mut self, proxy: Uri) -> Self {
        self.default_proxy = Some(proxy);
        self
    }

    pub fn with_alias(mut self, alias: Uri) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn with_timestamp(mut self, use_timestamp: bool) -> Self {
        self.use_timestamp = use_timestamp;
        self
    }

    pub fn with_blacklist(mut self, secs: u32) -> Self {
        self.blacklist = secs;
        self
    }

    pub fn with_graylist(mut self, secs: u32) -> Self {
        self.graylist = secs;
        self
    }

    pub fn with_extra_100(mut self, extra_100: bool) -> Self {
        self.extra_100 = extra_100;
        self
    }

    pub fn with_cancel_2543(mut self, cancel_2543: bool) -> Self {
        self.cancel_2543 = cancel_2543;
        self
    }

    pub fn with_max_proceeding(mut self, max: usize) -> Self {
        self.max_proceeding = max;
        self
    }

    pub fn with_udp_mtu(mut self, mtu: usize) -> Self {
        self.udp_mtu = mtu;
        self
    }

    pub fn with_debug_drop_prob(mut self, per_mille: u32) -> Self {
        self.debug_drop_prob = per_mille;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the relations between values
    pub fn validate(&self) -> Result<()> {
        if self.t1.is_zero() {
            return Err(Error::Config("t1 must be positive".into()));
        }
        if self.t2 < self.t1 {
            return Err(Error::Config("t2 must not be shorter than t1".into()));
        }
        if self.t1x64 < self.t1 {
            return Err(Error::Config("t1x64 must not be shorter than t1".into()));
        }
        if self.debug_drop_prob > 1000 {
            return Err(Error::Config(format!(
                "debug_drop_prob {} exceeds 1000",
                self.debug_drop_prob
            )));
        }
        if !(0.0..=1.0).contains(&self.extra_100_fraction) {
            return Err(Error::Config("extra_100_fraction must be within 0..=1".into()));
        }
        if self.transports.is_empty() {
            return Err(Error::Config("no transports configured".into()));
        }
        if self.retransmit_batch == 0 || self.timeout_batch == 0 {
            return Err(Error::Config("batch sizes must be positive".into()));
        }
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be positive".into()));
        }
        Ok(())
    }

    /// Delay before an automatic 100 Trying
    pub fn extra_100_delay(&self) -> Duration {
        self.t2.mul_f64(self.extra_100_fraction)
    }

    /// Resolver settings derived from this configuration
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            use_naptr: self.use_naptr,
            use_srv: self.use_srv,
            ip_family: self.ip_family,
            transports: self.transports.clone(),
            seed: self.seed,
        }
    }

    /// Whether the rport policy applies to messages received over `kind`
    pub fn rport_applies(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Tcp => self.tcp_rport,
            TransportKind::Tls => self.tls_rport,
            _ => true,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.t1, Duration::from_millis(500));
        assert_eq!(config.t1x64, Duration::from_secs(32));
        assert_eq!(config.extra_100_delay(), Duration::from_secs(2));
        assert_eq!(config.timer_c, Some(Duration::from_secs(185)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_user_agent_disables_default_timer_c() {
        let config = AgentConfig::default().with_user_agent(true);
        assert_eq!(config.timer_c, None);

        let config = AgentConfig::default()
            .with_timer_c(Some(Duration::from_secs(90)))
            .with_user_agent(true);
        assert_eq!(config.timer_c, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(AgentConfig::default().with_debug_drop_prob(1001).validate().is_err());
        assert!(AgentConfig::default()
            .with_t2(Duration::from_millis(100))
            .validate()
            .is_err());
        assert!(AgentConfig::default().with_transports(vec![]).validate().is_err());
    }

    #[test]
    fn test_json_overrides_named_fields_only() {
        let config =
            AgentConfig::from_json(r#"{"t1": 250, "ua": true, "server_rport": "always"}"#).unwrap();
        assert_eq!(config.t1, Duration::from_millis(250));
        assert!(config.ua);
        assert_eq!(config.server_rport, ServerRport::Always);
        assert_eq!(config.t2, Duration::from_secs(4));

        let back = serde_json::to_string(&config).unwrap();
        let again: AgentConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(again, config);

        assert!(AgentConfig::from_json(r#"{"t1": 0}"#).is_err());
    }
}
