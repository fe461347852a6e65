//! 设备命令解析边界
//!
//! 调用方输入（HTTP body 与 query 参数）在这里一次性转换成 [`DeviceCommand`]。
//! 缺省规则集中在此处：
//!
//! | 字段 | 来源 | 宽松模式缺省 |
//! |------|------|--------------|
//! | `mode` | body 字符串 | `""` |
//! | `amplitude` / `duration` | body 数字（小数截断） | `0` |
//! | `value` (set_amplitude) | body 数字优先，其次 query 开头的整数 | `0` |
//!
//! 严格模式下，格式错误的 JSON、类型不符的字段以及缺失的 `value` 都返回 [`CommandParseError`]。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{DeviceCommand, InjectRequest};

// 边界校验策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPolicy {
    /// 兼容现有固件：缺失或类型错误的字段取缺省值
    #[default]
    Permissive,
    /// 拒绝格式错误的输入
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    GetStatus,
    Inject,
    Stop,
    SetAmplitude,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Invalid field `{field}`: expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

/// 将调用方输入解析为设备命令
pub fn parse_command(
    kind: CommandKind,
    body: &[u8],
    query_value: Option<&str>,
    policy: BoundaryPolicy,
) -> Result<DeviceCommand, CommandParseError> {
    match kind {
        CommandKind::GetStatus => Ok(DeviceCommand::GetStatus),
        CommandKind::Stop => Ok(DeviceCommand::Stop),
        CommandKind::Inject => {
            let fields = body_object(body, policy)?;
            Ok(DeviceCommand::Inject(InjectRequest {
                mode: string_field(&fields, "mode", policy)?,
                amplitude: int_field(&fields, "amplitude", policy)?.unwrap_or(0),
                duration: int_field(&fields, "duration", policy)?.unwrap_or(0),
            }))
        }
        CommandKind::SetAmplitude => {
            let fields = body_object(body, policy)?;
            let from_body = int_field(&fields, "value", policy)?;
            let value = match from_body {
                Some(value) => value,
                None => match query_int(query_value, policy)? {
                    Some(value) => value,
                    None if policy == BoundaryPolicy::Strict => {
                        return Err(CommandParseError::InvalidField {
                            field: "value",
                            expected: "an integer in the body or query string",
                        })
                    }
                    None => 0,
                },
            };
            Ok(DeviceCommand::SetAmplitude { value })
        }
    }
}

// 空 body 视为 `{}`
fn body_object(body: &[u8], policy: BoundaryPolicy) -> Result<Map<String, Value>, CommandParseError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Map::new());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) if policy == BoundaryPolicy::Strict => Err(CommandParseError::MalformedBody(
            "expected a JSON object".to_string(),
        )),
        Err(e) if policy == BoundaryPolicy::Strict => {
            Err(CommandParseError::MalformedBody(e.to_string()))
        }
        _ => Ok(Map::new()),
    }
}

fn string_field(
    fields: &Map<String, Value>,
    field: &'static str,
    policy: BoundaryPolicy,
) -> Result<String, CommandParseError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) if policy == BoundaryPolicy::Strict => Err(CommandParseError::InvalidField {
            field,
            expected: "a string",
        }),
        Some(_) => Ok(String::new()),
    }
}

fn int_field(
    fields: &Map<String, Value>,
    field: &'static str,
    policy: BoundaryPolicy,
) -> Result<Option<i64>, CommandParseError> {
    let value = match fields.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    match policy {
        BoundaryPolicy::Strict => value
            .as_i64()
            .map(Some)
            .ok_or(CommandParseError::InvalidField {
                field,
                expected: "an integer",
            }),
        // 数字一律按浮点读取后截断
        BoundaryPolicy::Permissive => Ok(value.as_f64().map(|f| f.trunc() as i64)),
    }
}

fn query_int(raw: Option<&str>, policy: BoundaryPolicy) -> Result<Option<i64>, CommandParseError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(raw) => raw,
    };

    match policy {
        BoundaryPolicy::Strict => raw.parse::<i64>().map(Some).map_err(|_| {
            CommandParseError::InvalidField {
                field: "value",
                expected: "an integer",
            }
        }),
        BoundaryPolicy::Permissive => Ok(leading_int(raw)),
    }
}

// 读取开头的带符号整数，忽略其后的字符，如 "7abc" 读作 7
fn leading_int(raw: &str) -> Option<i64> {
    let digits_start = match raw.as_bytes().first() {
        Some(b'+') | Some(b'-') => 1,
        _ => 0,
    };
    let digits = raw[digits_start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }

    raw[..digits_start + digits].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissive(kind: CommandKind, body: &str, query: Option<&str>) -> DeviceCommand {
        parse_command(kind, body.as_bytes(), query, BoundaryPolicy::Permissive).unwrap()
    }

    #[test]
    fn test_inject_full_body() {
        let cmd = permissive(
            CommandKind::Inject,
            r#"{"mode": "quick", "amplitude": 80, "duration": 1500}"#,
            None,
        );
        assert_eq!(
            cmd,
            DeviceCommand::Inject(InjectRequest {
                mode: "quick".to_string(),
                amplitude: 80,
                duration: 1500,
            })
        );
    }

    #[test]
    fn test_inject_permissive_defaults() {
        let cmd = permissive(
            CommandKind::Inject,
            r#"{"mode": 7, "amplitude": 12.9, "duration": "long"}"#,
            None,
        );
        assert_eq!(
            cmd,
            DeviceCommand::Inject(InjectRequest {
                mode: String::new(),
                amplitude: 12,
                duration: 0,
            })
        );

        assert_eq!(
            permissive(CommandKind::Inject, "garbage", None),
            DeviceCommand::Inject(InjectRequest::default())
        );
        assert_eq!(
            permissive(CommandKind::Inject, "", None),
            DeviceCommand::Inject(InjectRequest::default())
        );
    }

    #[test]
    fn test_amplitude_body_wins_over_query() {
        let cmd = permissive(CommandKind::SetAmplitude, r#"{"value": 42}"#, Some("7"));
        assert_eq!(cmd, DeviceCommand::SetAmplitude { value: 42 });
    }

    #[test]
    fn test_amplitude_from_query() {
        let cmd = permissive(CommandKind::SetAmplitude, "", Some("7"));
        assert_eq!(cmd, DeviceCommand::SetAmplitude { value: 7 });

        let cmd = permissive(CommandKind::SetAmplitude, r#"{"value": "9"}"#, Some(" 7 "));
        assert_eq!(cmd, DeviceCommand::SetAmplitude { value: 7 });
    }

    #[test]
    fn test_amplitude_query_leading_integer() {
        let cases = [("7abc", 7), ("-12dB", -12), ("+3", 3), ("42.9", 42), ("x7", 0), ("-", 0)];

        for (query, expected) in cases {
            assert_eq!(
                permissive(CommandKind::SetAmplitude, "", Some(query)),
                DeviceCommand::SetAmplitude { value: expected },
                "{}",
                query
            );
        }

        assert!(parse_command(CommandKind::SetAmplitude, b"", Some("7abc"), BoundaryPolicy::Strict).is_err());
    }

    #[test]
    fn test_amplitude_defaults_to_zero() {
        assert_eq!(
            permissive(CommandKind::SetAmplitude, "", None),
            DeviceCommand::SetAmplitude { value: 0 }
        );
        assert_eq!(
            permissive(CommandKind::SetAmplitude, "{}", Some("loud")),
            DeviceCommand::SetAmplitude { value: 0 }
        );
    }

    #[test]
    fn test_strict_policy_rejects_bad_input() {
        let strict = BoundaryPolicy::Strict;

        assert!(matches!(
            parse_command(CommandKind::Inject, b"garbage", None, strict),
            Err(CommandParseError::MalformedBody(_))
        ));
        assert_eq!(
            parse_command(CommandKind::Inject, br#"{"amplitude": 1.5}"#, None, strict),
            Err(CommandParseError::InvalidField {
                field: "amplitude",
                expected: "an integer",
            })
        );
        assert!(parse_command(CommandKind::SetAmplitude, b"", Some("loud"), strict).is_err());
        assert!(parse_command(CommandKind::SetAmplitude, b"", None, strict).is_err());
        assert_eq!(
            parse_command(CommandKind::SetAmplitude, b"", Some("7"), strict),
            Ok(DeviceCommand::SetAmplitude { value: 7 })
        );
    }

    #[test]
    fn test_commands_without_payload() {
        assert_eq!(permissive(CommandKind::GetStatus, "ignored", None), DeviceCommand::GetStatus);
        assert_eq!(
            parse_command(CommandKind::Stop, b"not json", None, BoundaryPolicy::Strict),
            Ok(DeviceCommand::Stop)
        );
    }
}
