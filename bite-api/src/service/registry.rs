use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use super::Tracker;
use super::trackers;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Bugzilla,
    Bugzilla50,
    Bugzilla52,
    BugzillaRest,
    Bugzilla50Rest,
    Bugzilla52Rest,
    BugzillaJsonrpc,
    Bugzilla50Jsonrpc,
    Bugzilla52Jsonrpc,
    BugzillaXmlrpc,
    Bugzilla50Xmlrpc,
    Bugzilla52Xmlrpc,
    Jira,
    Github,
    Gitlab,
    Bitbucket,
    Redmine,
    Trac,
    TracJsonrpc,
    TracXmlrpc,
    Allura,
}

use ServiceKind::*;

const ALL: [ServiceKind; 21] = [
    Bugzilla,
    Bugzilla50,
    Bugzilla52,
    BugzillaRest,
    Bugzilla50Rest,
    Bugzilla52Rest,
    BugzillaJsonrpc,
    Bugzilla50Jsonrpc,
    Bugzilla52Jsonrpc,
    BugzillaXmlrpc,
    Bugzilla50Xmlrpc,
    Bugzilla52Xmlrpc,
    Jira,
    Github,
    Gitlab,
    Bitbucket,
    Redmine,
    Trac,
    TracJsonrpc,
    TracXmlrpc,
    Allura,
];

impl ServiceKind {
    pub fn all() -> &'static [ServiceKind] {
        &ALL
    }

    pub fn name(&self) -> &'static str {
        match self {
            Bugzilla => "bugzilla",
            Bugzilla50 => "bugzilla5.0",
            Bugzilla52 => "bugzilla5.2",
            BugzillaRest => "bugzilla-rest",
            Bugzilla50Rest => "bugzilla5.0-rest",
            Bugzilla52Rest => "bugzilla5.2-rest",
            BugzillaJsonrpc => "bugzilla-jsonrpc",
            Bugzilla50Jsonrpc => "bugzilla5.0-jsonrpc",
            Bugzilla52Jsonrpc => "bugzilla5.2-jsonrpc",
            BugzillaXmlrpc => "bugzilla-xmlrpc",
            Bugzilla50Xmlrpc => "bugzilla5.0-xmlrpc",
            Bugzilla52Xmlrpc => "bugzilla5.2-xmlrpc",
            Jira => "jira",
            Github => "github",
            Gitlab => "gitlab",
            Bitbucket => "bitbucket",
            Redmine => "redmine",
            Trac => "trac",
            TracJsonrpc => "trac-jsonrpc",
            TracXmlrpc => "trac-xmlrpc",
            Allura => "allura",
        }
    }

    /// Tracker family, shared by all versions and protocols.
    pub fn family(&self) -> &'static str {
        match self {
            Bugzilla | Bugzilla50 | Bugzilla52 | BugzillaRest | Bugzilla50Rest | Bugzilla52Rest
            | BugzillaJsonrpc | Bugzilla50Jsonrpc | Bugzilla52Jsonrpc | BugzillaXmlrpc
            | Bugzilla50Xmlrpc | Bugzilla52Xmlrpc => "bugzilla",
            Trac | TracJsonrpc | TracXmlrpc => "trac",
            other => other.name(),
        }
    }

    /// Candidates from most specific to most generic.
    pub fn fallbacks(&self) -> &'static [ServiceKind] {
        match self {
            Bugzilla => &[Bugzilla, BugzillaRest],
            Bugzilla50 => &[Bugzilla50, Bugzilla50Rest, BugzillaRest, Bugzilla],
            Bugzilla52 => &[Bugzilla52, Bugzilla52Rest, BugzillaRest, Bugzilla],
            BugzillaRest => &[BugzillaRest],
            Bugzilla50Rest => &[Bugzilla50Rest, BugzillaRest],
            Bugzilla52Rest => &[Bugzilla52Rest, BugzillaRest],
            BugzillaJsonrpc => &[BugzillaJsonrpc],
            Bugzilla50Jsonrpc => &[Bugzilla50Jsonrpc, BugzillaJsonrpc],
            Bugzilla52Jsonrpc => &[Bugzilla52Jsonrpc, BugzillaJsonrpc],
            BugzillaXmlrpc => &[BugzillaXmlrpc],
            Bugzilla50Xmlrpc => &[Bugzilla50Xmlrpc, BugzillaXmlrpc],
            Bugzilla52Xmlrpc => &[Bugzilla52Xmlrpc, BugzillaXmlrpc],
            Jira => &[Jira],
            Github => &[Github],
            Gitlab => &[Gitlab],
            Bitbucket => &[Bitbucket],
            Redmine => &[Redmine],
            Trac => &[Trac, TracJsonrpc],
            TracJsonrpc => &[TracJsonrpc],
            TracXmlrpc => &[TracXmlrpc],
            Allura => &[Allura],
        }
    }

    /// Whether a concrete tracker exists for exactly this kind.
    pub fn is_implemented(&self) -> bool {
        matches!(
            self,
            BugzillaRest
                | Bugzilla52Rest
                | BugzillaJsonrpc
                | BugzillaXmlrpc
                | Jira
                | Github
                | Gitlab
                | Bitbucket
                | Redmine
                | TracJsonrpc
                | TracXmlrpc
                | Allura
        )
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        ALL.iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| Error::Config(format!("unknown service: {}", s)))
    }
}

fn build(kind: ServiceKind, config: &ServiceConfig) -> Result<Arc<dyn Tracker>> {
    let tracker: Arc<dyn Tracker> = match kind {
        BugzillaRest => Arc::new(trackers::Bugzilla::rest(config, false)),
        Bugzilla52Rest => Arc::new(trackers::Bugzilla::rest(config, true)),
        BugzillaJsonrpc => Arc::new(trackers::Bugzilla::jsonrpc(config)),
        BugzillaXmlrpc => Arc::new(trackers::Bugzilla::xmlrpc(config)),
        Jira => Arc::new(trackers::Jira::new(config)),
        Github => Arc::new(trackers::Github::new(config)?),
        Gitlab => Arc::new(trackers::Gitlab::new(config)?),
        Bitbucket => Arc::new(trackers::Bitbucket::new(config)?),
        Redmine => Arc::new(trackers::Redmine::new(config)),
        TracJsonrpc => Arc::new(trackers::Trac::new(config)),
        TracXmlrpc => Arc::new(trackers::Trac::xmlrpc(config)),
        Allura => Arc::new(trackers::Allura::new(config)?),
        other => return Err(Error::Unsupported(format!("no tracker for {}", other))),
    };
    Ok(tracker)
}

/// Walks the configured kind's fallbacks to the first implemented tracker.
pub fn resolve(config: &ServiceConfig) -> Result<Arc<dyn Tracker>> {
    let kind = config
        .kind
        .fallbacks()
        .iter()
        .copied()
        .find(ServiceKind::is_implemented)
        .ok_or_else(|| Error::Config(format!("no implementation for service: {}", config.kind)))?;
    debug!(requested = %config.kind, resolved = %kind, "resolved service");
    build(kind, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in ServiceKind::all() {
            assert_eq!(kind.name().parse::<ServiceKind>().unwrap(), *kind);
        }
        assert!("launchpad".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_every_kind_resolves_to_an_implementation() {
        for kind in ServiceKind::all() {
            assert_eq!(kind.fallbacks()[0], *kind);
            assert!(
                kind.fallbacks().iter().any(ServiceKind::is_implemented),
                "{} has no implemented fallback",
                kind
            );
        }
    }

    #[test]
    fn test_resolve_walks_fallbacks() {
        // Given: 実装を持たないバージョン指定のサービス
        let config = ServiceConfig::new("https://bugs.example.org", Bugzilla50Jsonrpc).unwrap();

        // When: 解決
        let tracker = resolve(&config).unwrap();

        // Then: 汎用のJSON-RPC実装に落ちる
        assert_eq!(tracker.kind(), BugzillaJsonrpc);

        let config = ServiceConfig::new("https://bugs.example.org", Bugzilla52).unwrap();
        assert_eq!(resolve(&config).unwrap().kind(), Bugzilla52Rest);

        let config = ServiceConfig::new("https://trac.example.org/proj", Trac).unwrap();
        assert_eq!(resolve(&config).unwrap().kind(), TracJsonrpc);

        let config = ServiceConfig::new("https://bugs.example.org", Bugzilla50Xmlrpc).unwrap();
        assert_eq!(resolve(&config).unwrap().kind(), BugzillaXmlrpc);

        let config = ServiceConfig::new("https://trac.example.org/proj", TracXmlrpc).unwrap();
        assert_eq!(resolve(&config).unwrap().kind(), TracXmlrpc);
    }

    #[test]
    fn test_family() {
        assert_eq!(Bugzilla52Rest.family(), "bugzilla");
        assert_eq!(TracJsonrpc.family(), "trac");
        assert_eq!(Github.family(), "github");
    }
}
