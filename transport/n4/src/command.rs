//! Command protocol: §4.5. The first thing read off any newly opened mux
//! stream is a length-prefixed list of strings `[cmd, arg1, ...]`; this
//! module owns parsing that list into a typed [`Command`] and the
//! read/write helpers shared by every command-speaking role (client,
//! bridge, exit).

use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("command {0} expects {1} argument(s)")]
    WrongArity(&'static str, usize),
}

/// A parsed command-stream request, per the §4.5 table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Ping,
    PingRepeat,
    Ip,
    Proxy { host_port: String },
    Conn { host: String },
    ConnFeedback { host: String },
    Tcp,
}

impl Command {
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Command::Ping => vec!["ping".to_string()],
            Command::PingRepeat => vec!["ping/repeat".to_string()],
            Command::Ip => vec!["ip".to_string()],
            Command::Proxy { host_port } => vec!["proxy".to_string(), host_port.clone()],
            Command::Conn { host } => vec!["conn".to_string(), host.clone()],
            Command::ConnFeedback { host } => vec!["conn/feedback".to_string(), host.clone()],
            Command::Tcp => vec!["tcp".to_string()],
        }
    }

    pub fn from_args(mut args: Vec<String>) -> Result<Self, Error> {
        if args.is_empty() {
            return Err(Error::Empty);
        }
        let cmd = args.remove(0);
        match cmd.as_str() {
            "ping" => Ok(Command::Ping),
            "ping/repeat" => Ok(Command::PingRepeat),
            "ip" => Ok(Command::Ip),
            "proxy" => {
                if args.len() != 1 {
                    return Err(Error::WrongArity("proxy", 1));
                }
                Ok(Command::Proxy { host_port: args.remove(0) })
            }
            "conn" => {
                if args.len() != 1 {
                    return Err(Error::WrongArity("conn", 1));
                }
                Ok(Command::Conn { host: args.remove(0) })
            }
            "conn/feedback" => {
                if args.len() != 1 {
                    return Err(Error::WrongArity("conn/feedback", 1));
                }
                Ok(Command::ConnFeedback { host: args.remove(0) })
            }
            "tcp" => Ok(Command::Tcp),
            other => Err(Error::Unknown(other.to_string())),
        }
    }
}

pub async fn write_command<W: AsyncWrite + Unpin>(w: &mut W, cmd: &Command) -> Result<(), Error> {
    n4_wire::write_value(w, &cmd.to_args()).await?;
    Ok(())
}

pub async fn read_command<R: AsyncRead + Unpin>(r: &mut R) -> Result<Command, Error> {
    let args: Vec<String> = n4_wire::read_value(r)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Command::from_args(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_has_no_args() {
        assert_eq!(Command::Ping.to_args(), vec!["ping".to_string()]);
    }

    #[test]
    fn proxy_roundtrips_through_args() {
        let cmd = Command::Proxy {
            host_port: "example.com:443".to_string(),
        };
        let parsed = Command::from_args(cmd.to_args()).unwrap();
        assert_eq!(cmd, parsed);
    }

    #[test]
    fn proxy_with_wrong_arity_is_rejected() {
        let result = Command::from_args(vec!["proxy".to_string()]);
        assert!(matches!(result, Err(Error::WrongArity("proxy", 1))));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let result = Command::from_args(vec!["frobnicate".to_string()]);
        assert!(matches!(result, Err(Error::Unknown(_))));
    }

    #[test]
    fn empty_args_is_rejected() {
        assert!(matches!(Command::from_args(vec![]), Err(Error::Empty)));
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let cmd = Command::Conn {
            host: "exit.example.net".to_string(),
        };
        let mut buf = Vec::new();
        write_command(&mut buf, &cmd).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = read_command(&mut cursor).await.unwrap();
        assert_eq!(cmd, parsed);
    }
}
