use std::env;

use crate::engine::alerts::AlertPatterns;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub event_buffer_size: usize,
    pub alert_patterns: AlertPatterns,
    pub route_average_speed_kmh: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = AlertPatterns::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: parse_or_default("LOG_JSON", false)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            alert_patterns: AlertPatterns {
                offer_loop_ms: pattern_or_default("OFFER_VIBRATION_MS", defaults.offer_loop_ms)?,
                arrival_ms: pattern_or_default("ARRIVAL_VIBRATION_MS", defaults.arrival_ms)?,
            },
            route_average_speed_kmh: parse_or_default("ROUTE_AVERAGE_SPEED_KMH", 60.0)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn pattern_or_default(key: &str, default: Vec<u64>) -> Result<Vec<u64>, AppError> {
    match env::var(key) {
        Ok(raw) => parse_pattern(&raw).map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn parse_pattern(raw: &str) -> Result<Vec<u64>, String> {
    let pattern = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>().map_err(|err| format!("{part:?}: {err}")))
        .collect::<Result<Vec<_>, _>>()?;

    if pattern.is_empty() {
        return Err("empty pattern".to_string());
    }
    Ok(pattern)
}

#[cfg(test)]
mod tests {
    use super::parse_pattern;

    #[test]
    fn vibration_pattern_is_comma_separated_millis() {
        assert_eq!(parse_pattern("0, 800,400 ,800"), Ok(vec![0, 800, 400, 800]));
        assert!(parse_pattern("0,fast").is_err());
    }
}
