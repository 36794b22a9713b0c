//! Client/daemon version compatibility gate.

use semver::Version;

/// Verdict of a compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// The pair may talk.
    Compatible,
    /// The pair must not talk; the message says which side to upgrade.
    Incompatible(String),
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible)
    }

    /// The rejection message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Compatible => None,
            Self::Incompatible(msg) => Some(msg),
        }
    }
}

/// Checks whether a client at `client_version` may talk to a daemon at
/// `daemon_version`.
///
/// - Empty client version: allowed (trusted local caller).
/// - Invalid semver on either side: allowed (dev builds).
/// - Differing major versions: rejected either way.
/// - Same major with the daemon older than the client: rejected; the
///   daemon must upgrade. A minor-version gap additionally warns that the
///   schema may have drifted.
/// - Same major with the daemon at or above the client: allowed.
pub fn check_compatibility(daemon_version: &str, client_version: &str) -> Compatibility {
    if client_version.is_empty() {
        return Compatibility::Compatible;
    }
    let (Ok(daemon), Ok(client)) = (
        Version::parse(daemon_version),
        Version::parse(client_version),
    ) else {
        return Compatibility::Compatible;
    };

    if daemon.major != client.major {
        let msg = if daemon.major < client.major {
            format!(
                "daemon {daemon} is a major version behind client {client}; upgrade the daemon"
            )
        } else {
            format!(
                "client {client} is a major version behind daemon {daemon}; upgrade the client"
            )
        };
        return Compatibility::Incompatible(msg);
    }

    if daemon < client {
        let mut msg =
            format!("daemon {daemon} is older than client {client}; upgrade the daemon");
        if daemon.minor != client.minor {
            msg.push_str(" (minor versions differ; the schema may have drifted)");
        }
        return Compatibility::Incompatible(msg);
    }

    Compatibility::Compatible
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_allowed() {
        assert!(check_compatibility("1.2.0", "").is_compatible());
    }

    #[test]
    fn invalid_semver_allowed() {
        assert!(check_compatibility("1.2.0", "dev-build").is_compatible());
        assert!(check_compatibility("not-a-version", "1.0.0").is_compatible());
    }

    #[test]
    fn major_mismatch_rejected_both_ways() {
        let v = check_compatibility("1.2.0", "2.0.0");
        assert!(!v.is_compatible());
        assert!(v.message().unwrap().contains("upgrade the daemon"));

        let v = check_compatibility("2.0.0", "1.9.9");
        assert!(!v.is_compatible());
        assert!(v.message().unwrap().contains("upgrade the client"));
    }

    #[test]
    fn older_daemon_same_major_rejected() {
        let v = check_compatibility("1.2.0", "1.2.5");
        assert!(!v.is_compatible());
        assert!(v.message().unwrap().contains("upgrade the daemon"));
        // Same minor: no drift warning.
        assert!(!v.message().unwrap().contains("drifted"));
    }

    #[test]
    fn minor_gap_warns_of_schema_drift() {
        let v = check_compatibility("1.2.0", "1.3.0");
        assert!(!v.is_compatible());
        assert!(v.message().unwrap().contains("drifted"));
    }

    #[test]
    fn newer_daemon_same_major_allowed() {
        assert!(check_compatibility("1.5.0", "1.2.9").is_compatible());
        assert!(check_compatibility("1.2.0", "1.2.0").is_compatible());
    }
}
