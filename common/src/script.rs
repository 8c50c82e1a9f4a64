//! Device scripts delivered over the air.
//!
//! A script is a list of calls into a fixed set of device operations, one
//! per line:
//!
//! ```text
//! # blink the status led
//! print("starting")
//! blink(3, 10, 1000)
//! publish("done")
//! ```
//!
//! Nothing in a script runs until the whole text has parsed, so a typo on
//! the last line leaves the device untouched.

use std::{fmt, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown operation `{name}`")]
    UnknownOperation { line: usize, name: String },
    #[error("line {line}: `{name}` expects {expected}")]
    Arguments {
        line: usize,
        name: &'static str,
        expected: &'static str,
    },
    #[error("script sleeps for {requested_ms} ms, limit is {limit_ms} ms")]
    SleepBudget { requested_ms: u128, limit_ms: u128 },
    #[error("pin {pin}: {reason}")]
    Pin { pin: u8, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    pub max_sleep: Duration,
    pub max_pin: u8,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_sleep: Duration::from_secs(60),
            max_pin: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    Print(String),
    Publish(String),
    Pin { pin: u8, high: bool },
    Sleep(Duration),
    Blink { pin: u8, times: u32, period: Duration },
}

/// Capabilities a device exposes to scripts.
pub trait DeviceHost {
    fn print(&mut self, line: &str);
    fn publish_debug(&mut self, text: &str);
    fn set_pin(&mut self, pin: u8, high: bool) -> Result<(), ScriptError>;
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceScript {
    commands: Vec<ScriptCommand>,
}

impl DeviceScript {
    pub fn parse(source: &str, limits: &ScriptLimits) -> Result<Self, ScriptError> {
        let mut commands = Vec::new();
        for (index, raw_line) in source.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            commands.push(parse_line(index + 1, line, limits)?);
        }

        let script = Self { commands };
        let requested = script.total_sleep();
        if requested > limits.max_sleep {
            return Err(ScriptError::SleepBudget {
                requested_ms: requested.as_millis(),
                limit_ms: limits.max_sleep.as_millis(),
            });
        }
        Ok(script)
    }

    pub fn commands(&self) -> &[ScriptCommand] {
        &self.commands
    }

    pub fn total_sleep(&self) -> Duration {
        self.commands
            .iter()
            .map(|command| match command {
                ScriptCommand::Sleep(duration) => *duration,
                ScriptCommand::Blink { times, period, .. } => period.saturating_mul(*times),
                _ => Duration::ZERO,
            })
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Runs every command in order and stops at the first failure.
    pub fn run<H: DeviceHost + ?Sized>(&self, host: &mut H) -> Result<(), ScriptError> {
        for command in &self.commands {
            match command {
                ScriptCommand::Print(line) => host.print(line),
                ScriptCommand::Publish(text) => host.publish_debug(text),
                ScriptCommand::Pin { pin, high } => host.set_pin(*pin, *high)?,
                ScriptCommand::Sleep(duration) => host.sleep(*duration),
                ScriptCommand::Blink { pin, times, period } => {
                    let on = *period / 2;
                    let off = period.saturating_sub(on);
                    for _ in 0..*times {
                        host.set_pin(*pin, true)?;
                        host.sleep(on);
                        host.set_pin(*pin, false)?;
                        host.sleep(off);
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_line(line: usize, text: &str, limits: &ScriptLimits) -> Result<ScriptCommand, ScriptError> {
    let syntax = |message: &str| ScriptError::Syntax {
        line,
        message: message.to_string(),
    };

    let open = text.find('(').ok_or_else(|| syntax("expected `name(...)`"))?;
    let close = text.rfind(')').ok_or_else(|| syntax("missing `)`"))?;
    if close < open {
        return Err(syntax("missing `)`"));
    }

    let trailing = text[close + 1..].trim();
    if !trailing.is_empty() && !trailing.starts_with('#') {
        return Err(syntax("unexpected text after `)`"));
    }

    let name = text[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(syntax("invalid operation name"));
    }

    let args = split_args(line, &text[open + 1..close])?;
    build_command(line, name, args, limits)
}

fn split_args(line: usize, text: &str) -> Result<Vec<ScriptValue>, ScriptError> {
    let syntax = |message: String| ScriptError::Syntax { line, message };

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut values = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut quote: Option<char> = None;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) if c == '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some('t') => current.push('\t'),
                Some(other) => current.push(other),
                None => return Err(syntax("unterminated escape".to_string())),
            },
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                if quoted || !current.trim().is_empty() {
                    return Err(syntax(format!("unexpected quote in `{text}`")));
                }
                current.clear();
                quoted = true;
                quote = Some(c);
            }
            None if c == ',' => {
                values.push(parse_value(line, &current, quoted)?);
                current.clear();
                quoted = false;
            }
            None if quoted => {
                if !c.is_whitespace() {
                    return Err(syntax(format!("unexpected text after string in `{text}`")));
                }
            }
            None => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(syntax("unterminated string".to_string()));
    }
    values.push(parse_value(line, &current, quoted)?);
    Ok(values)
}

fn parse_value(line: usize, raw: &str, quoted: bool) -> Result<ScriptValue, ScriptError> {
    if quoted {
        return Ok(ScriptValue::Str(raw.to_string()));
    }

    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ScriptError::Syntax {
            line,
            message: "empty argument".to_string(),
        });
    }

    match raw {
        "True" => return Ok(ScriptValue::Bool(true)),
        "False" => return Ok(ScriptValue::Bool(false)),
        _ => {}
    }

    if let Ok(value) = raw.parse::<i64>() {
        return Ok(ScriptValue::Int(value));
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(ScriptValue::Float(value)),
        _ => Err(ScriptError::Syntax {
            line,
            message: format!("unsupported argument `{raw}`"),
        }),
    }
}

fn build_command(
    line: usize,
    name: &str,
    args: Vec<ScriptValue>,
    limits: &ScriptLimits,
) -> Result<ScriptCommand, ScriptError> {
    match name {
        "print" => Ok(ScriptCommand::Print(
            args.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "publish" => match args.as_slice() {
            [value] => Ok(ScriptCommand::Publish(value.to_string())),
            _ => Err(arguments(line, "publish", "one value")),
        },
        "pin" => match args.as_slice() {
            [pin, value] => {
                let pin = pin_number(pin, limits)
                    .ok_or_else(|| arguments(line, "pin", "a pin number and 0/1"))?;
                let high = match value {
                    ScriptValue::Bool(high) => *high,
                    ScriptValue::Int(0) => false,
                    ScriptValue::Int(1) => true,
                    _ => return Err(arguments(line, "pin", "a pin number and 0/1")),
                };
                Ok(ScriptCommand::Pin { pin, high })
            }
            _ => Err(arguments(line, "pin", "a pin number and 0/1")),
        },
        "sleep" => match args.as_slice() {
            [ScriptValue::Int(seconds)] if *seconds >= 0 => Ok(ScriptCommand::Sleep(
                Duration::from_secs(*seconds as u64),
            )),
            [ScriptValue::Float(seconds)] if *seconds >= 0.0 => Ok(ScriptCommand::Sleep(
                Duration::try_from_secs_f64(*seconds)
                    .map_err(|_| arguments(line, "sleep", "a non-negative number of seconds"))?,
            )),
            _ => Err(arguments(line, "sleep", "a non-negative number of seconds")),
        },
        "sleep_ms" => match args.as_slice() {
            [ScriptValue::Int(ms)] if *ms >= 0 => {
                Ok(ScriptCommand::Sleep(Duration::from_millis(*ms as u64)))
            }
            _ => Err(arguments(line, "sleep_ms", "a non-negative number of milliseconds")),
        },
        "blink" => match args.as_slice() {
            [pin, ScriptValue::Int(times), ScriptValue::Int(period_ms)]
                if *times >= 0 && *period_ms >= 0 =>
            {
                let pin = pin_number(pin, limits).ok_or_else(|| {
                    arguments(line, "blink", "a pin number, a count and a period in ms")
                })?;
                Ok(ScriptCommand::Blink {
                    pin,
                    times: u32::try_from(*times).unwrap_or(u32::MAX),
                    period: Duration::from_millis(*period_ms as u64),
                })
            }
            _ => Err(arguments(
                line,
                "blink",
                "a pin number, a count and a period in ms",
            )),
        },
        other => Err(ScriptError::UnknownOperation {
            line,
            name: other.to_string(),
        }),
    }
}

fn pin_number(value: &ScriptValue, limits: &ScriptLimits) -> Option<u8> {
    match value {
        ScriptValue::Int(pin) => u8::try_from(*pin).ok().filter(|pin| *pin <= limits.max_pin),
        _ => None,
    }
}

fn arguments(line: usize, name: &'static str, expected: &'static str) -> ScriptError {
    ScriptError::Arguments {
        line,
        name,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingHost {
        events: Vec<String>,
        slept: Duration,
    }

    impl DeviceHost for RecordingHost {
        fn print(&mut self, line: &str) {
            self.events.push(format!("print:{line}"));
        }

        fn publish_debug(&mut self, text: &str) {
            self.events.push(format!("debug:{text}"));
        }

        fn set_pin(&mut self, pin: u8, high: bool) -> Result<(), ScriptError> {
            if pin == 13 {
                return Err(ScriptError::Pin {
                    pin,
                    reason: "reserved for the one-wire bus".to_string(),
                });
            }
            self.events.push(format!("pin:{pin}:{}", u8::from(high)));
            Ok(())
        }

        fn sleep(&mut self, duration: Duration) {
            self.slept += duration;
        }
    }

    fn parse(source: &str) -> Result<DeviceScript, ScriptError> {
        DeviceScript::parse(source, &ScriptLimits::default())
    }

    #[test]
    fn parses_and_runs_calls() {
        let script = parse(
            "# comment\n\nprint(1)\nprint(\"temp\", 22.5, True)\npin(3, 1)  # led\nsleep(0.5)\npin(3, False)\npublish('done')\n",
        )
        .unwrap();

        let mut host = RecordingHost::default();
        script.run(&mut host).unwrap();

        assert_eq!(
            host.events,
            vec![
                "print:1",
                "print:temp 22.5 True",
                "pin:3:1",
                "pin:3:0",
                "debug:done",
            ]
        );
        assert_eq!(host.slept, Duration::from_millis(500));
    }

    #[test]
    fn blink_toggles_and_sleeps_for_each_period() {
        let script = parse("blink(3, 2, 1000)").unwrap();
        assert_eq!(script.total_sleep(), Duration::from_secs(2));

        let mut host = RecordingHost::default();
        script.run(&mut host).unwrap();

        assert_eq!(host.events, vec!["pin:3:1", "pin:3:0", "pin:3:1", "pin:3:0"]);
        assert_eq!(host.slept, Duration::from_secs(2));
    }

    #[test]
    fn strings_keep_commas_and_escapes() {
        let script = parse(r#"print("a, b", 'it\'s', "x\ny")"#).unwrap();
        assert_eq!(
            script.commands(),
            &[ScriptCommand::Print("a, b it's x\ny".to_string())]
        );
    }

    #[test]
    fn print_without_arguments_prints_empty_line() {
        let script = parse("print()").unwrap();
        assert_eq!(script.commands(), &[ScriptCommand::Print(String::new())]);
    }

    #[test]
    fn rejects_unknown_operations_before_running() {
        let err = parse("print(1)\nimport os\n").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { line: 2, .. }));

        let err = parse("print(1)\nexec('x')\n").unwrap_err();
        assert_eq!(
            err,
            ScriptError::UnknownOperation {
                line: 2,
                name: "exec".to_string()
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(
            parse("pin(99, 1)").unwrap_err(),
            ScriptError::Arguments { name: "pin", .. }
        ));
        assert!(matches!(
            parse("pin(3, 2)").unwrap_err(),
            ScriptError::Arguments { name: "pin", .. }
        ));
        assert!(matches!(
            parse("sleep(-1)").unwrap_err(),
            ScriptError::Arguments { name: "sleep", .. }
        ));
        assert!(matches!(
            parse("publish()").unwrap_err(),
            ScriptError::Arguments { name: "publish", .. }
        ));
        assert!(matches!(
            parse("print(1,)").unwrap_err(),
            ScriptError::Syntax { .. }
        ));
        assert!(matches!(
            parse("print(\"open)").unwrap_err(),
            ScriptError::Syntax { .. }
        ));
        assert!(matches!(
            parse("print(x)").unwrap_err(),
            ScriptError::Syntax { .. }
        ));
    }

    #[test]
    fn enforces_sleep_budget() {
        let err = parse("sleep(30)\nblink(3, 31, 1000)").unwrap_err();
        assert_eq!(
            err,
            ScriptError::SleepBudget {
                requested_ms: 61_000,
                limit_ms: 60_000
            }
        );
    }

    #[test]
    fn pin_failures_stop_the_script() {
        let script = parse("pin(3, 1)\npin(13, 1)\nprint(\"unreached\")").unwrap();
        let mut host = RecordingHost::default();

        let err = script.run(&mut host).unwrap_err();

        assert!(matches!(err, ScriptError::Pin { pin: 13, .. }));
        assert_eq!(host.events, vec!["pin:3:1"]);
    }
}
