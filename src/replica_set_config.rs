/*!
 * Replica set configuration model
 * Immutable configuration snapshots, member descriptions and tag patterns
 */

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bson::{doc, Bson, Document};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RookDBError};
use crate::write_concern::{WriteConcern, MAJORITY_MODE, STEP_DOWN_CHECK_MODE};

pub const CONFIG_VERSION_FIELD: &str = "version";
pub const MAX_MEMBERS: usize = 50;

/// Internal tag key carried by every electable member; backs the
/// `$stepDownCheck` write mode.
const ELECTABLE_TAG_KEY: &str = "$electable";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = RookDBError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RookDBError::BadValue(format!("host missing port: '{}'", s)))?;
        if host.is_empty() {
            return Err(RookDBError::BadValue(format!("empty host in '{}'", s)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| RookDBError::BadValue(format!("bad port in '{}'", s)))?;
        Ok(HostAndPort::new(host, port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: i64,
    pub host: HostAndPort,
    pub votes: i64,
    pub priority: f64,
    pub tags: HashMap<String, String>,
    pub hidden: bool,
    pub build_indexes: bool,
    pub slave_delay: Duration,
    pub arbiter_only: bool,
}

impl MemberConfig {
    pub fn new(id: i64, host: HostAndPort) -> Self {
        Self {
            id,
            host,
            votes: 1,
            priority: 1.0,
            tags: HashMap::new(),
            hidden: false,
            build_indexes: true,
            slave_delay: Duration::ZERO,
            arbiter_only: false,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.votes > 0
    }

    /// A member that may stand for election.
    pub fn is_electable(&self) -> bool {
        self.is_voter() && self.priority > 0.0 && !self.arbiter_only && !self.hidden
            && self.slave_delay.is_zero()
    }

    /// User tags plus the internal tags derived from member properties.
    pub fn effective_tags(&self) -> Vec<(String, String)> {
        let mut tags: Vec<(String, String)> = self
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if self.is_electable() {
            tags.push((ELECTABLE_TAG_KEY.to_string(), self.id.to_string()));
        }
        tags
    }

    fn from_document(doc: &Document) -> Result<MemberConfig> {
        let id = get_number(doc, "_id")
            .ok_or_else(|| RookDBError::BadValue("member missing _id".to_string()))?;
        let host_str = doc
            .get_str("host")
            .map_err(|_| RookDBError::BadValue("member missing host".to_string()))?;
        let host: HostAndPort = host_str.parse()?;

        let mut member = MemberConfig::new(id, host);
        if let Some(v) = get_number(doc, "votes") {
            member.votes = v;
        }
        if let Some(p) = get_float(doc, "priority") {
            member.priority = p;
        }
        if let Ok(b) = doc.get_bool("arbiterOnly") {
            member.arbiter_only = b;
        }
        if let Ok(b) = doc.get_bool("hidden") {
            member.hidden = b;
        }
        if let Ok(b) = doc.get_bool("buildIndexes") {
            member.build_indexes = b;
        }
        if let Some(secs) = get_number(doc, "slaveDelay") {
            member.slave_delay = Duration::from_secs(secs.max(0) as u64);
        }
        if let Ok(tags) = doc.get_document("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(s) = v {
                    member.tags.insert(k.clone(), s.clone());
                }
            }
        }
        if member.arbiter_only {
            member.priority = 0.0;
        }
        Ok(member)
    }

    fn to_document(&self) -> Document {
        let mut doc = doc! {
            "_id": self.id,
            "host": self.host.to_string(),
            "votes": self.votes,
            "priority": self.priority,
        };
        if self.arbiter_only {
            doc.insert("arbiterOnly", true);
        }
        if self.hidden {
            doc.insert("hidden", true);
        }
        if !self.build_indexes {
            doc.insert("buildIndexes", false);
        }
        if !self.slave_delay.is_zero() {
            doc.insert("slaveDelay", self.slave_delay.as_secs() as i64);
        }
        if !self.tags.is_empty() {
            let mut tags = Document::new();
            for (k, v) in &self.tags {
                tags.insert(k.clone(), v.clone());
            }
            doc.insert("tags", tags);
        }
        doc
    }
}

/// A tag pattern: for each named tag key, the number of distinct tag values
/// that must have reached the awaited position.
#[derive(Debug, Clone, PartialEq)]
pub struct TagPattern {
    pub constraints: Vec<(String, usize)>,
}

/// Incremental matcher over a tag pattern. Feed it member tags one at a time;
/// `update` reports true as soon as the whole pattern is satisfied.
pub struct TagMatcher {
    pattern: TagPattern,
    seen: HashMap<String, HashSet<String>>,
}

impl TagMatcher {
    pub fn new(pattern: &TagPattern) -> Self {
        Self {
            pattern: pattern.clone(),
            seen: HashMap::new(),
        }
    }

    /// Record one (key, value) tag. Returns true when this tag advanced the
    /// match and every constraint is now satisfied.
    pub fn update(&mut self, key: &str, value: &str) -> bool {
        let counted = self
            .pattern
            .constraints
            .iter()
            .any(|(k, _)| k == key);
        if !counted {
            return false;
        }
        let advanced = self
            .seen
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
        advanced && self.is_satisfied()
    }

    pub fn is_satisfied(&self) -> bool {
        self.pattern.constraints.iter().all(|(key, min)| {
            self.seen.get(key).map(|s| s.len()).unwrap_or(0) >= *min
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSetConfig {
    pub name: String,
    pub version: i64,
    pub members: Vec<MemberConfig>,
    pub heartbeat_timeout: Duration,
    pub chaining_allowed: bool,
    custom_write_modes: HashMap<String, TagPattern>,
    initialized: bool,
}

impl Default for ReplicaSetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: 0,
            members: Vec::new(),
            heartbeat_timeout: Duration::from_secs(10),
            chaining_allowed: true,
            custom_write_modes: HashMap::new(),
            initialized: false,
        }
    }
}

impl ReplicaSetConfig {
    /// Parse a configuration document: `{_id, version, members: [...],
    /// settings: {...}}`. The document is validated structurally; set-wide
    /// validation happens in `validate`.
    pub fn initialize(doc: &Document) -> Result<ReplicaSetConfig> {
        let mut config = ReplicaSetConfig {
            name: doc.get_str("_id").unwrap_or("").to_string(),
            version: get_number(doc, CONFIG_VERSION_FIELD)
                .ok_or_else(|| RookDBError::BadValue("config missing version".to_string()))?,
            ..Default::default()
        };

        let members = doc
            .get_array("members")
            .map_err(|_| RookDBError::BadValue("config missing members array".to_string()))?;
        for entry in members {
            let member_doc = match entry {
                Bson::Document(d) => d,
                _ => {
                    return Err(RookDBError::BadValue(
                        "members array holds a non-document entry".to_string(),
                    ))
                }
            };
            config.members.push(MemberConfig::from_document(member_doc)?);
        }

        if let Ok(settings) = doc.get_document("settings") {
            if let Some(secs) = get_number(settings, "heartbeatTimeoutSecs") {
                config.heartbeat_timeout = Duration::from_secs(secs.max(0) as u64);
            }
            if let Ok(b) = settings.get_bool("chainingAllowed") {
                config.chaining_allowed = b;
            }
            if let Ok(modes) = settings.get_document("getLastErrorModes") {
                for (mode, spec) in modes.iter() {
                    let spec = match spec {
                        Bson::Document(d) => d,
                        _ => {
                            return Err(RookDBError::BadValue(format!(
                                "write mode '{}' is not a document",
                                mode
                            )))
                        }
                    };
                    let mut constraints = Vec::new();
                    for (tag, count) in spec.iter() {
                        let count = match count {
                            Bson::Int32(n) => *n as i64,
                            Bson::Int64(n) => *n,
                            Bson::Double(n) => *n as i64,
                            _ => {
                                return Err(RookDBError::BadValue(format!(
                                    "write mode '{}' tag '{}' count is not numeric",
                                    mode, tag
                                )))
                            }
                        };
                        if count < 1 {
                            return Err(RookDBError::BadValue(format!(
                                "write mode '{}' tag '{}' count must be positive",
                                mode, tag
                            )));
                        }
                        constraints.push((tag.clone(), count as usize));
                    }
                    config
                        .custom_write_modes
                        .insert(mode.clone(), TagPattern { constraints });
                }
            }
        }

        config.initialized = true;
        Ok(config)
    }

    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "_id": self.name.clone(),
            "version": self.version,
        };
        let members: Vec<Bson> = self
            .members
            .iter()
            .map(|m| Bson::Document(m.to_document()))
            .collect();
        doc.insert("members", members);

        let mut settings = doc! {
            "heartbeatTimeoutSecs": self.heartbeat_timeout.as_secs() as i64,
            "chainingAllowed": self.chaining_allowed,
        };
        if !self.custom_write_modes.is_empty() {
            let mut modes = Document::new();
            for (mode, pattern) in &self.custom_write_modes {
                let mut spec = Document::new();
                for (tag, count) in &pattern.constraints {
                    spec.insert(tag.clone(), *count as i64);
                }
                modes.insert(mode.clone(), spec);
            }
            settings.insert("getLastErrorModes", modes);
        }
        doc.insert("settings", settings);
        doc
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn member_at(&self, index: usize) -> &MemberConfig {
        &self.members[index]
    }

    pub fn find_member_by_id(&self, id: i64) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn find_member_by_host(&self, host: &HostAndPort) -> Option<usize> {
        self.members.iter().position(|m| &m.host == host)
    }

    pub fn total_votes(&self) -> i64 {
        self.members.iter().map(|m| m.votes).sum()
    }

    pub fn majority_vote_count(&self) -> i32 {
        (self.total_votes() / 2 + 1) as i32
    }

    /// Resolve a named write mode into a tag pattern. `$stepDownCheck` is
    /// synthesized: two distinct electable members at the awaited position,
    /// the departing primary plus at least one other.
    pub fn find_custom_write_mode(&self, mode: &str) -> Result<TagPattern> {
        if mode == STEP_DOWN_CHECK_MODE {
            return Ok(TagPattern {
                constraints: vec![(ELECTABLE_TAG_KEY.to_string(), 2)],
            });
        }
        self.custom_write_modes
            .get(mode)
            .cloned()
            .ok_or_else(|| {
                RookDBError::UnknownReplWriteConcern(format!(
                    "write concern mode '{}' is not defined in the replica set configuration",
                    mode
                ))
            })
    }

    /// Configuration-level satisfiability of a write concern, independent of
    /// current progress.
    pub fn check_if_write_concern_can_be_satisfied(&self, wc: &WriteConcern) -> Result<()> {
        if !wc.w_mode.is_empty() {
            if wc.w_mode == MAJORITY_MODE {
                return Ok(());
            }
            let pattern = self.find_custom_write_mode(&wc.w_mode)?;
            for (key, min) in &pattern.constraints {
                let distinct: HashSet<&str> = self
                    .members
                    .iter()
                    .flat_map(|m| m.tags.iter())
                    .filter(|(k, _)| k.as_str() == key.as_str())
                    .map(|(_, v)| v.as_str())
                    .collect();
                if distinct.len() < *min && key != ELECTABLE_TAG_KEY {
                    return Err(RookDBError::CannotSatisfyWriteConcern(format!(
                        "not enough nodes carry distinct values for tag '{}'",
                        key
                    )));
                }
            }
            return Ok(());
        }
        let data_bearing = self.members.iter().filter(|m| !m.arbiter_only).count();
        if wc.w_num_nodes as usize > data_bearing {
            return Err(RookDBError::CannotSatisfyWriteConcern(format!(
                "w={} exceeds the {} data-bearing members of the set",
                wc.w_num_nodes, data_bearing
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.version < 1 {
            return Err(RookDBError::BadValue(format!(
                "config version must be at least 1, got {}",
                self.version
            )));
        }
        if self.members.is_empty() {
            return Err(RookDBError::BadValue(
                "replica set configuration must have at least one member".to_string(),
            ));
        }
        if self.members.len() > MAX_MEMBERS {
            return Err(RookDBError::BadValue(format!(
                "replica set configuration cannot have more than {} members",
                MAX_MEMBERS
            )));
        }
        let mut ids = HashSet::new();
        let mut hosts = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(RookDBError::BadValue(format!(
                    "duplicate member _id {}",
                    member.id
                )));
            }
            if !hosts.insert(member.host.clone()) {
                return Err(RookDBError::BadValue(format!(
                    "duplicate member host {}",
                    member.host
                )));
            }
        }
        if self.total_votes() < 1 {
            return Err(RookDBError::BadValue(
                "replica set configuration must have at least one voting member".to_string(),
            ));
        }
        Ok(())
    }

    /// Find the unique member describing the local node. `is_self` is the
    /// caller's notion of address identity.
    pub fn find_self<F>(&self, is_self: F) -> Result<usize>
    where
        F: Fn(&HostAndPort) -> bool,
    {
        let mine: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| is_self(&m.host))
            .map(|(i, _)| i)
            .collect();
        match mine.len() {
            0 => Err(RookDBError::NodeNotFound(
                "local node is not present in the replica set configuration".to_string(),
            )),
            1 => Ok(mine[0]),
            n => Err(RookDBError::BadValue(format!(
                "local node matches {} members of the configuration; exactly one required",
                n
            ))),
        }
    }
}

/// Force-reconfig version bump: rewrite `version` to
/// `old + 10000 + U[0, 100000)` drawn from the OS CSPRNG so a forced config
/// cannot be overtaken by a legitimately advancing cluster in one step.
pub fn increment_config_version_by_random(doc: &Document) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        if key == CONFIG_VERSION_FIELD {
            let old = match value {
                Bson::Int32(n) => *n as i64,
                Bson::Int64(n) => *n,
                Bson::Double(n) => *n as i64,
                other => {
                    out.insert(key.clone(), other.clone());
                    continue;
                }
            };
            let random: i64 = OsRng.gen_range(0..100_000);
            out.insert(key.clone(), old + 10_000 + random);
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

fn get_number(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        _ => None,
    }
}

fn get_float(doc: &Document, key: &str) -> Option<f64> {
    match doc.get(key)? {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}
