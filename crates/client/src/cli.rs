use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use driveway_protocol::Actuator;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/driveway/driveway.toml";

#[derive(Debug, Default, PartialEq)]
pub(crate) struct Args {
    pub config_path: PathBuf,
    pub host: Option<String>,
    pub token: Option<String>,
    pub log_json: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    parse_from(std::env::args().skip(1))
}

fn parse_from(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut host = None;
    let mut token = None;
    let mut log_json = false;

    let args: Vec<String> = args.into_iter().collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("driveway {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("driveway - gate and garage remote control client");
                println!();
                println!("USAGE:");
                println!("    driveway [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!(
                    "    --config <PATH>      Config file [default: {DEFAULT_CONFIG_PATH}]"
                );
                println!("    --host <HOST[:PORT]> Controller host, overrides controller.host");
                println!(
                    "    --token <TOKEN>      Access token (prefer DRIVEWAY_TOKEN env)"
                );
                println!("    --log-json           Log as JSON lines on stderr");
                println!("    -V, --version        Print version and exit");
                println!("    -h, --help           Print this help and exit");
                println!();
                println!("COMMANDS (stdin, one per line):");
                println!("    gate | garage        Press an actuator");
                println!("    blur | focus         Report window focus changes");
                println!("    quit                 Close the session and exit");
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                config_path = args.get(i).context("Missing --config value")?.into();
            }
            "--host" => {
                i += 1;
                host = Some(args.get(i).context("Missing --host value")?.clone());
            }
            "--token" => {
                // Visible in /proc; DRIVEWAY_TOKEN is the better place.
                i += 1;
                token = Some(args.get(i).context("Missing --token value")?.clone());
            }
            "--log-json" => log_json = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        host,
        token,
        log_json,
    })
}

/// One line of user input on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Press(Actuator),
    Blur,
    Focus,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blur" => Ok(Command::Blur),
            "focus" => Ok(Command::Focus),
            "quit" | "exit" => Ok(Command::Quit),
            other => other
                .parse::<Actuator>()
                .map(Command::Press)
                .with_context(|| format!("Unknown command: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Args> {
        parse_from(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_without_arguments() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.host, None);
        assert_eq!(args.token, None);
        assert!(!args.log_json);
    }

    #[test]
    fn overrides_are_collected() {
        let args = parse(&[
            "--config",
            "driveway.toml",
            "--host",
            "gate.local:8080",
            "--token",
            "abc",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(
            args,
            Args {
                config_path: "driveway.toml".into(),
                host: Some("gate.local:8080".into()),
                token: Some("abc".into()),
                log_json: true,
            }
        );
    }

    #[test]
    fn missing_value_is_an_error() {
        let err = parse(&["--host"]).unwrap_err();
        assert!(err.to_string().contains("--host"));
    }

    #[test]
    fn unknown_argument_is_an_error() {
        assert!(parse(&["--display", ":0"]).is_err());
    }

    #[test]
    fn stdin_commands() {
        assert_eq!("gate".parse::<Command>().unwrap(), Command::Press(Actuator::Gate));
        assert_eq!(" Garage \n".parse::<Command>().unwrap(), Command::Press(Actuator::Garage));
        assert_eq!("blur".parse::<Command>().unwrap(), Command::Blur);
        assert_eq!("focus".parse::<Command>().unwrap(), Command::Focus);
        assert_eq!("quit".parse::<Command>().unwrap(), Command::Quit);
        assert!("door".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }
}
