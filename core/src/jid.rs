use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SERVER_JID: &str = "s.whatsapp.net";

#[derive(Debug, Error)]
pub enum JidError {
    #[error("Invalid JID format: {0}")]
    InvalidFormat(String),
    #[error("Failed to parse component: {0}")]
    Parse(#[from] std::num::ParseIntError),
}

/// A peer identifier of the form `user[.agent][:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub agent: u8,
    pub device: u16,
}

impl Jid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            ..Default::default()
        }
    }

    pub fn server_jid() -> Self {
        Self::new("", SERVER_JID)
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            Some((u, s)) => (u, s),
            None => ("", s),
        };

        if server.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }
        if user_part.is_empty() {
            return Ok(Jid::new("", server));
        }

        let (user_base, device_str) = match user_part.rsplit_once(':') {
            Some((u, d)) => (u, Some(d)),
            None => (user_part, None),
        };

        let (user, agent_str) = match user_base.rsplit_once('.') {
            Some((u, a)) => (u, Some(a)),
            None => (user_base, None),
        };

        let agent = agent_str.map(str::parse).transpose()?.unwrap_or(0);
        let device = device_str.map(str::parse).transpose()?.unwrap_or(0);

        Ok(Jid {
            user: user.to_string(),
            server: server.to_string(),
            agent,
            device,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return write!(f, "{}", self.server);
        }
        write!(f, "{}", self.user)?;
        if self.agent > 0 {
            write!(f, ".{}", self.agent)?;
        }
        if self.device > 0 {
            write!(f, ":{}", self.device)?;
        }
        write!(f, "@{}", self.server)
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::from_str(&value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_and_agent() {
        let jid: Jid = "1234.1:7@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234");
        assert_eq!(jid.agent, 1);
        assert_eq!(jid.device, 7);
        assert_eq!(jid.to_string(), "1234.1:7@s.whatsapp.net");
    }

    #[test]
    fn server_only() {
        let jid: Jid = "s.whatsapp.net".parse().unwrap();
        assert!(jid.user.is_empty());
        assert_eq!(jid.to_string(), "s.whatsapp.net");
    }

    #[test]
    fn rejects_garbage_device() {
        assert!("1234:x@s.whatsapp.net".parse::<Jid>().is_err());
        assert!("1234@".parse::<Jid>().is_err());
    }
}
