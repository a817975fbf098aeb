use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::format::{Item, StrftimeItems};
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::{seq::SliceRandom, Rng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fixed pool of browser User-Agent strings for `{{random_user_agent}}`.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.144 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.144 Mobile Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 OPR/106.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 OPR/106.0.0.0",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-A536B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.144 Mobile Safari/537.36",
];

/// Fixed pool of ISO 3166-1 alpha-2 country codes for `{{random_country}}`.
const COUNTRY_CODES: &[&str] = &[
    "US", "GB", "CA", "AU", "DE", "FR", "IT", "ES", "NL", "BE", "CH", "AT", "SE", "NO", "DK",
    "FI", "PL", "CZ", "RO", "HU", "EG", "SA", "AE", "QA", "KW", "BH", "OM", "JO", "LB", "IQ",
    "IN", "PK", "BD", "ID", "MY", "SG", "TH", "VN", "PH", "JP", "KR", "CN", "TW", "HK", "BR",
    "MX", "AR", "CL", "CO", "ZA",
];

const LETTERS_LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const LETTERS_UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const HEX_CHARS: &[u8] = b"0123456789abcdef";
const SYMBOLS: &[u8] = b"!@#$%^&*";
const ALPHANUM: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

type HmacSha256 = Hmac<Sha256>;

/// Resolves `{{name}}` and `{{func(args)}}` references to strings.
///
/// Resolution order for plain names: session variables, built-in generators,
/// prefix-parameterised generators, then a literal `{{name}}` fallback so a
/// typo stays visible in the rendered output.
#[derive(Debug, Default)]
pub struct VariableProcessor;

impl VariableProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a plain variable reference.
    pub fn resolve(&self, name: &str, session: &HashMap<String, String>) -> String {
        if let Some(value) = session.get(name) {
            return value.clone();
        }
        if let Some(value) = builtin(name) {
            return value;
        }
        if let Some(value) = parameterised(name) {
            return value;
        }
        format!("{{{{{name}}}}}")
    }

    /// Invoke a template function. Returns `None` for unknown function names
    /// so the caller can round-trip the original placeholder.
    pub fn call_function(&self, name: &str, args: &[String]) -> Option<String> {
        let out = match name {
            "hmac_sha256" => {
                if args.len() != 2 {
                    return Some("ERROR:hmac_sha256_needs_2_args".to_string());
                }
                match HmacSha256::new_from_slice(args[0].as_bytes()) {
                    Ok(mut mac) => {
                        mac.update(args[1].as_bytes());
                        hex::encode(mac.finalize().into_bytes())
                    }
                    Err(_) => "ERROR:hmac_sha256_invalid_key".to_string(),
                }
            }
            "base64_encode" => {
                if args.len() != 1 {
                    return Some("ERROR:base64_encode_needs_1_arg".to_string());
                }
                BASE64.encode(args[0].as_bytes())
            }
            "md5" => {
                if args.len() != 1 {
                    return Some("ERROR:md5_needs_1_arg".to_string());
                }
                let mut hasher = Md5::new();
                hasher.update(args[0].as_bytes());
                hex::encode(hasher.finalize())
            }
            "sha256" => {
                if args.len() != 1 {
                    return Some("ERROR:sha256_needs_1_arg".to_string());
                }
                hex::encode(Sha256::digest(args[0].as_bytes()))
            }
            "time_future" => return Some(time_shifted(args, 1)),
            "time_past" => return Some(time_shifted(args, -1)),
            "random_choice" => {
                if args.is_empty() {
                    return Some(String::new());
                }
                let mut rng = rand::thread_rng();
                args[rng.gen_range(0..args.len())].clone()
            }
            "random_int_range" => {
                if args.len() != 2 {
                    return Some("ERROR:random_int_range_needs_min_max".to_string());
                }
                let min: i64 = args[0].trim().parse().unwrap_or(0);
                let max: i64 = args[1].trim().parse().unwrap_or(0);
                if max <= min {
                    min.to_string()
                } else {
                    rand::thread_rng().gen_range(min..max).to_string()
                }
            }
            "random_float_range" => {
                if args.len() < 2 {
                    return Some("ERROR:random_float_range_needs_min_max".to_string());
                }
                let min: f64 = args[0].trim().parse().unwrap_or(0.0);
                let max: f64 = args[1].trim().parse().unwrap_or(0.0);
                let decimals: usize = args
                    .get(2)
                    .and_then(|d| d.trim().parse().ok())
                    .unwrap_or(2);
                let value = if max > min {
                    min + rand::thread_rng().gen_range(0.0..1.0) * (max - min)
                } else {
                    min
                };
                format!("{value:.decimals$}")
            }
            "random_string" => {
                let length: usize = args
                    .first()
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(10);
                let charset: &[u8] = args.get(1).map(|c| c.as_bytes()).unwrap_or(ALPHANUM);
                if charset.is_empty() {
                    return Some(String::new());
                }
                random_from_charset(length, charset)
            }
            "regex_gen" => {
                if args.len() != 1 {
                    return Some("ERROR:regex_gen_needs_pattern".to_string());
                }
                match rand_regex::Regex::compile(&args[0], 10) {
                    Ok(generator) => rand::thread_rng().sample(&generator),
                    Err(_) => "ERROR:regex_gen_failed".to_string(),
                }
            }
            _ => return None,
        };
        Some(out)
    }
}

/// `time_future` and `time_past`. The first argument is a duration such as
/// `24h`; the optional second argument is a strftime layout, default RFC3339.
fn time_shifted(args: &[String], sign: i64) -> String {
    let Some(duration_arg) = args.first() else {
        return if sign > 0 {
            "ERROR:time_future_needs_duration".to_string()
        } else {
            "ERROR:time_past_needs_duration".to_string()
        };
    };
    let Ok(dur) = humantime::parse_duration(duration_arg.trim()) else {
        return "ERROR:invalid_duration".to_string();
    };
    let Ok(delta) = chrono::Duration::from_std(dur) else {
        return "ERROR:invalid_duration".to_string();
    };
    let when = if sign > 0 {
        Utc::now() + delta
    } else {
        Utc::now() - delta
    };
    match args.get(1) {
        Some(layout) => {
            let items: Vec<Item> = StrftimeItems::new(layout).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return "ERROR:invalid_time_layout".to_string();
            }
            when.format_with_items(items.iter()).to_string()
        }
        None => when.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Zero-argument built-in generators.
fn builtin(name: &str) -> Option<String> {
    let mut rng = rand::thread_rng();
    let value = match name {
        "uuid" => Uuid::new_v4().to_string(),
        "random_int" => rng.gen_range(0..100_000).to_string(),
        "timestamp" => Utc::now().timestamp().to_string(),
        "timestamp_ms" => Utc::now().timestamp_millis().to_string(),
        "random_email" => format!("user{}@example.com", rng.gen_range(0..1_000_000)),
        "random_name" => {
            let names = [
                "Alice", "Bob", "Charlie", "David", "Eve", "Frank", "Grace", "Heidi",
            ];
            format!(
                "{} {}",
                names[rng.gen_range(0..names.len())],
                rng.gen_range(0..1000)
            )
        }
        "random_phone" => format!("+1-555-01{:02}", rng.gen_range(0..100)),
        "random_domain" => format!("{}.example.com", random_from_charset(4, ALPHANUM)),
        "random_alphanum" => random_from_charset(10, ALPHANUM),
        "random_bool" => if rng.gen_bool(0.5) { "true" } else { "false" }.to_string(),
        "random_float" => format!("{:.6}", rng.gen_range(0.0..1.0f64)),
        "iso8601" => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "random_ipv4" => format!(
            "{}.{}.{}.{}",
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256)
        ),
        "random_user_agent" => USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())].to_string(),
        "random_mac" => format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256)
        ),
        "random_color" => format!(
            "#{:02x}{:02x}{:02x}",
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(0..256)
        ),
        "random_password" => random_password(&mut rng),
        "random_country" => COUNTRY_CODES[rng.gen_range(0..COUNTRY_CODES.len())].to_string(),
        _ => return None,
    };
    Some(value)
}

/// Length-parameterised generator families: `random_digits_N`, `random_hex_N`
/// and `random_alphanum_N`. Invalid or missing lengths fall back to the
/// family default; lengths are capped.
fn parameterised(name: &str) -> Option<String> {
    if let Some(suffix) = name.strip_prefix("random_digits_") {
        let length = parse_positive(suffix, 10, 20);
        return Some(random_from_charset(length, DIGITS));
    }
    if let Some(suffix) = name.strip_prefix("random_hex_") {
        let length = parse_positive(suffix, 8, 64);
        return Some(random_from_charset(length, HEX_CHARS));
    }
    if let Some(suffix) = name.strip_prefix("random_alphanum_") {
        let length = parse_positive(suffix, 10, 64);
        return Some(random_from_charset(length, ALPHANUM));
    }
    None
}

/// 12 characters with at least one upper, lower, digit and symbol, shuffled.
fn random_password(rng: &mut impl Rng) -> String {
    let mut password = Vec::with_capacity(12);
    password.push(LETTERS_UPPER[rng.gen_range(0..LETTERS_UPPER.len())]);
    password.push(LETTERS_LOWER[rng.gen_range(0..LETTERS_LOWER.len())]);
    password.push(DIGITS[rng.gen_range(0..DIGITS.len())]);
    password.push(SYMBOLS[rng.gen_range(0..SYMBOLS.len())]);
    let all: Vec<u8> = ALPHANUM.iter().chain(SYMBOLS.iter()).copied().collect();
    for _ in 4..12 {
        password.push(all[rng.gen_range(0..all.len())]);
    }
    password.shuffle(rng);
    String::from_utf8_lossy(&password).into_owned()
}

fn random_from_charset(length: usize, charset: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..length)
        .map(|_| charset[rng.gen_range(0..charset.len())])
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse a decimal length with a default for invalid input and an upper cap.
fn parse_positive(input: &str, default: usize, max: usize) -> usize {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return default;
    }
    match input.parse::<usize>() {
        Ok(0) | Err(_) => default,
        Ok(n) => n.min(max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn resolve(name: &str) -> String {
        VariableProcessor::new().resolve(name, &HashMap::new())
    }

    #[test]
    fn session_shadows_builtins() {
        let vp = VariableProcessor::new();
        let mut session = HashMap::new();
        session.insert("uuid".to_string(), "fixed".to_string());
        assert_eq!(vp.resolve("uuid", &session), "fixed");
    }

    #[test]
    fn uuid_is_parseable() {
        assert!(Uuid::parse_str(&resolve("uuid")).is_ok());
    }

    #[test]
    fn ipv4_shape() {
        let pattern = Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap();
        assert!(pattern.is_match(&resolve("random_ipv4")));
    }

    #[test]
    fn mac_shape() {
        let pattern = Regex::new(r"^([0-9A-F]{2}:){5}[0-9A-F]{2}$").unwrap();
        assert!(pattern.is_match(&resolve("random_mac")));
    }

    #[test]
    fn password_composition() {
        for _ in 0..20 {
            let pw = resolve("random_password");
            assert_eq!(pw.len(), 12);
            assert!(pw.bytes().any(|b| b.is_ascii_uppercase()));
            assert!(pw.bytes().any(|b| b.is_ascii_lowercase()));
            assert!(pw.bytes().any(|b| b.is_ascii_digit()));
            assert!(pw.bytes().any(|b| SYMBOLS.contains(&b)));
        }
    }

    #[test]
    fn parameterised_lengths_and_caps() {
        assert_eq!(resolve("random_digits_5").len(), 5);
        assert_eq!(resolve("random_digits_999").len(), 20);
        assert_eq!(resolve("random_digits_abc").len(), 10);
        assert_eq!(resolve("random_hex_").len(), 8);
        assert_eq!(resolve("random_alphanum_64").len(), 64);
        assert_eq!(resolve("random_alphanum_100").len(), 64);
    }

    #[test]
    fn country_pool_membership() {
        assert!(COUNTRY_CODES.contains(&resolve("random_country").as_str()));
    }

    #[test]
    fn unknown_name_round_trips() {
        assert_eq!(resolve("no_such_generator"), "{{no_such_generator}}");
    }

    #[test]
    fn hmac_known_vector() {
        let vp = VariableProcessor::new();
        let out = vp
            .call_function("hmac_sha256", &["key".to_string(), "data".to_string()])
            .unwrap();
        assert_eq!(
            out,
            "5031fe3d989c6d1537a013fa6e739da23463fdaec3b70137d828e36ace221bd0"
        );
    }

    #[test]
    fn digest_known_vectors() {
        let vp = VariableProcessor::new();
        assert_eq!(
            vp.call_function("md5", &["x".to_string()]).unwrap(),
            "9dd4e461268c8034f5c8564e155c67a6"
        );
        assert_eq!(
            vp.call_function("sha256", &["abc".to_string()]).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn arity_violations_return_sentinels() {
        let vp = VariableProcessor::new();
        assert_eq!(
            vp.call_function("hmac_sha256", &["only-key".to_string()]).unwrap(),
            "ERROR:hmac_sha256_needs_2_args"
        );
        assert_eq!(
            vp.call_function("time_future", &[]).unwrap(),
            "ERROR:time_future_needs_duration"
        );
        assert_eq!(
            vp.call_function("time_future", &["not-a-duration".to_string()])
                .unwrap(),
            "ERROR:invalid_duration"
        );
    }

    #[test]
    fn random_int_range_bounds() {
        let vp = VariableProcessor::new();
        for _ in 0..50 {
            let out = vp
                .call_function(
                    "random_int_range",
                    &["10".to_string(), "20".to_string()],
                )
                .unwrap();
            let n: i64 = out.parse().unwrap();
            assert!((10..20).contains(&n));
        }
        // Inverted range collapses to min.
        assert_eq!(
            vp.call_function("random_int_range", &["9".to_string(), "3".to_string()])
                .unwrap(),
            "9"
        );
    }

    #[test]
    fn random_choice_picks_from_args() {
        let vp = VariableProcessor::new();
        let args = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let out = vp.call_function("random_choice", &args).unwrap();
        assert!(args.contains(&out));
    }

    #[test]
    fn unknown_function_is_none() {
        let vp = VariableProcessor::new();
        assert!(vp.call_function("frobnicate", &[]).is_none());
    }

    #[test]
    fn time_future_is_in_the_future() {
        let vp = VariableProcessor::new();
        let out = vp
            .call_function("time_future", &["1h".to_string()])
            .unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(&out).unwrap();
        assert!(parsed.timestamp() > Utc::now().timestamp() + 3000);
    }
}
