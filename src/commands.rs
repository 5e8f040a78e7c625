use crate::error::{Result, SafetyError};
use crate::fake_call::FakeCallConfig;

/// One line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sos,
    FakeCall(FakeCallConfig),
    Cancel,
    Accept,
    Decline,
    Record,
    StopRecording,
    Police,
    Zones,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  sos                            send an SOS alert
  fake <delay> <name> [number]   schedule a fake incoming call
  cancel | accept | decline      control the fake call
  record | stop                  start/stop evidence recording
  police                         dial the emergency number
  zones                          refresh danger zones
  status                         print a status line
  quit                           tear down and exit";

/// Parse a console line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "sos" => Command::Sos,
        "fake" => {
            let delay = words
                .next()
                .ok_or_else(|| SafetyError::Validation("usage: fake <delay> <name> [number]".into()))?;
            let delay_seconds: u32 = delay
                .parse()
                .map_err(|_| SafetyError::Validation(format!("invalid delay: {}", delay)))?;
            let caller_name = words.next().unwrap_or_default().to_string();
            let caller_number = words.next().unwrap_or_default().to_string();
            let config = FakeCallConfig {
                caller_name,
                caller_number,
                delay_seconds,
            };
            config.validate()?;
            Command::FakeCall(config)
        }
        "cancel" => Command::Cancel,
        "accept" => Command::Accept,
        "decline" => Command::Decline,
        "record" => Command::Record,
        "stop" => Command::StopRecording,
        "police" | "call" => Command::Police,
        "zones" => Command::Zones,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => {
            return Err(SafetyError::Validation(format!(
                "unknown command '{}' (try 'help')",
                other
            )))
        }
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("sos").unwrap(), Some(Command::Sos));
        assert_eq!(parse("  QUIT ").unwrap(), Some(Command::Quit));
        assert_eq!(parse("stop").unwrap(), Some(Command::StopRecording));
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_fake_call_arguments() {
        assert_eq!(
            parse("fake 10 Mom +919876543210").unwrap(),
            Some(Command::FakeCall(FakeCallConfig {
                caller_name: "Mom".into(),
                caller_number: "+919876543210".into(),
                delay_seconds: 10,
            }))
        );
        let Some(Command::FakeCall(config)) = parse("fake 5 Boss").unwrap() else {
            panic!("expected fake call");
        };
        assert_eq!(config.caller_number, "");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(parse("fake"), Err(SafetyError::Validation(_))));
        assert!(matches!(parse("fake soon Mom"), Err(SafetyError::Validation(_))));
        assert!(matches!(parse("fake 0 Mom"), Err(SafetyError::Validation(_))));
        assert!(matches!(parse("fake 5"), Err(SafetyError::Validation(_))));
        assert!(matches!(parse("dance"), Err(SafetyError::Validation(_))));
    }
}
