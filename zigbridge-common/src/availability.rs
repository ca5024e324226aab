use serde::{Deserialize, Serialize};

/// Availability payload published on retained availability topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Reachable.
    Online,
    /// Not reachable, or the bridge itself is gone.
    Offline,
}

impl Availability {
    /// Payload string used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }

    /// Map an online flag to an availability value.
    pub fn from_online(online: bool) -> Self {
        if online {
            Availability::Online
        } else {
            Availability::Offline
        }
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_strings() {
        assert_eq!(Availability::Online.as_str(), "online");
        assert_eq!(Availability::from_online(false), Availability::Offline);
        assert_eq!(
            serde_json::to_string(&Availability::Offline).unwrap(),
            "\"offline\""
        );
    }
}
