//! Binance stream naming and combined-stream URL building.
//!
//! Stream names take the form `<symbol_lower_nosep>@<suffix>` where the
//! suffix is `trade`, `ticker`, `depth[<levels>][@<speed>ms]` or
//! `kline_<interval>`. A combined URL multiplexes many names:
//! `<base>/stream?streams=<s1>/<s2>/…`.

use crate::error::{WsError, WsResult};
use marketflow_core::{DataType, KlineInterval};
use std::collections::{BTreeMap, HashSet};

/// Depth levels Binance accepts for partial book streams.
pub const DEPTH_LEVELS: [u16; 3] = [5, 10, 20];
/// Update speeds Binance accepts, in milliseconds.
pub const DEPTH_SPEEDS_MS: [u16; 2] = [100, 1000];
/// Per-connection combined stream limit.
pub const MAX_STREAMS_PER_CONNECTION: usize = 1024;

/// Abstract stream kind, prior to exchange-specific naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Trade,
    Ticker,
    Depth {
        levels: Option<u16>,
        speed_ms: Option<u16>,
    },
    Kline(KlineInterval),
}

impl StreamKind {
    /// The canonical data type this stream carries.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Trade => DataType::Trade,
            Self::Ticker => DataType::Ticker,
            Self::Depth { .. } => DataType::Depth,
            Self::Kline(interval) => DataType::Kline(*interval),
        }
    }
}

/// Lowercase a symbol and strip the `/` separator: `BTC/USDT` -> `btcusdt`.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| *c != '/')
        .collect::<String>()
        .to_lowercase()
}

/// Build the Binance stream name for `(symbol, kind)`.
///
/// Rejects empty symbols and depth parameters outside the exchange's
/// accepted sets.
pub fn build_stream_name(symbol: &str, kind: &StreamKind) -> WsResult<String> {
    let sym = normalize_symbol(symbol);
    if sym.is_empty() || !sym.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(WsError::InvalidArgument(format!(
            "symbol not representable in a stream name: {symbol}"
        )));
    }

    let name = match kind {
        StreamKind::Trade => format!("{sym}@trade"),
        StreamKind::Ticker => format!("{sym}@ticker"),
        StreamKind::Kline(interval) => format!("{sym}@kline_{interval}"),
        StreamKind::Depth { levels, speed_ms } => {
            if let Some(levels) = levels {
                if !DEPTH_LEVELS.contains(levels) {
                    return Err(WsError::InvalidArgument(format!(
                        "unsupported depth levels: {levels}"
                    )));
                }
            }
            if let Some(speed) = speed_ms {
                if !DEPTH_SPEEDS_MS.contains(speed) {
                    return Err(WsError::InvalidArgument(format!(
                        "unsupported depth speed: {speed}ms"
                    )));
                }
            }
            let mut name = format!("{sym}@depth");
            if let Some(levels) = levels {
                name.push_str(&levels.to_string());
            }
            if let Some(speed) = speed_ms {
                name.push_str(&format!("@{speed}ms"));
            }
            name
        }
    };
    Ok(name)
}

/// Parse a stream name back into `(raw_symbol, kind)`.
///
/// Levels and speed on depth streams are independently optional: `depth`,
/// `depth5`, `depth@100ms` and `depth5@100ms` all parse.
pub fn parse_stream_name(name: &str) -> WsResult<(String, StreamKind)> {
    let mut parts = name.split('@');
    let symbol = parts
        .next()
        .filter(|s| {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
        .ok_or_else(|| WsError::InvalidStreamName(name.to_string()))?;
    let suffix = parts
        .next()
        .ok_or_else(|| WsError::InvalidStreamName(name.to_string()))?;
    let speed_part = parts.next();
    if parts.next().is_some() {
        return Err(WsError::InvalidStreamName(name.to_string()));
    }

    let speed_ms = match speed_part {
        None => None,
        Some(part) => {
            let digits = part
                .strip_suffix("ms")
                .ok_or_else(|| WsError::InvalidStreamName(name.to_string()))?;
            let speed: u16 = digits
                .parse()
                .map_err(|_| WsError::InvalidStreamName(name.to_string()))?;
            if !DEPTH_SPEEDS_MS.contains(&speed) {
                return Err(WsError::InvalidStreamName(name.to_string()));
            }
            Some(speed)
        }
    };

    let kind = match suffix {
        "trade" if speed_ms.is_none() => StreamKind::Trade,
        "ticker" if speed_ms.is_none() => StreamKind::Ticker,
        _ => {
            if let Some(interval) = suffix.strip_prefix("kline_") {
                if speed_ms.is_some() {
                    return Err(WsError::InvalidStreamName(name.to_string()));
                }
                let interval: KlineInterval = interval
                    .parse()
                    .map_err(|_| WsError::InvalidStreamName(name.to_string()))?;
                StreamKind::Kline(interval)
            } else if let Some(levels_part) = suffix.strip_prefix("depth") {
                let levels = if levels_part.is_empty() {
                    None
                } else {
                    let levels: u16 = levels_part
                        .parse()
                        .map_err(|_| WsError::InvalidStreamName(name.to_string()))?;
                    if !DEPTH_LEVELS.contains(&levels) {
                        return Err(WsError::InvalidStreamName(name.to_string()));
                    }
                    Some(levels)
                };
                StreamKind::Depth { levels, speed_ms }
            } else {
                return Err(WsError::InvalidStreamName(name.to_string()));
            }
        }
    };

    Ok((symbol.to_string(), kind))
}

/// Syntactic gate for stream names: `^[a-z0-9]+@[a-z0-9_]+(@[0-9]+ms)?$`.
pub fn is_valid_stream_name(name: &str) -> bool {
    let segments: Vec<&str> = name.split('@').collect();
    if segments.len() < 2 || segments.len() > 3 {
        return false;
    }
    let symbol_ok = !segments[0].is_empty()
        && segments[0]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let suffix_ok = !segments[1].is_empty()
        && segments[1]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    let speed_ok = match segments.get(2) {
        None => true,
        Some(part) => part
            .strip_suffix("ms")
            .is_some_and(|d| !d.is_empty() && d.chars().all(|c| c.is_ascii_digit())),
    };
    symbol_ok && suffix_ok && speed_ok
}

/// Encoding applied to each stream name inside the combined URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlEncoding {
    /// Names are joined literally.
    #[default]
    None,
    /// Each name is percent-encoded as a URI component (`@` -> `%40`).
    Component,
}

/// Options for `build_combined_stream_url`.
#[derive(Debug, Clone)]
pub struct CombinedUrlOptions {
    pub max_streams: usize,
    pub encoding: UrlEncoding,
}

impl Default for CombinedUrlOptions {
    fn default() -> Self {
        Self {
            max_streams: MAX_STREAMS_PER_CONNECTION,
            encoding: UrlEncoding::None,
        }
    }
}

/// Build the combined stream URL `<base>/stream?streams=<s1>/<s2>/…`.
///
/// Deduplicates in first-seen order, rejects empty input, invalid names and
/// oversize sets, and strips a trailing `/` from the base URL.
pub fn build_combined_stream_url(
    streams: &[String],
    base_url: &str,
    opts: &CombinedUrlOptions,
) -> WsResult<String> {
    if streams.is_empty() {
        return Err(WsError::InvalidArgument(
            "stream set must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for name in streams {
        if !is_valid_stream_name(name) {
            return Err(WsError::InvalidStreamName(name.clone()));
        }
        if seen.insert(name.as_str()) {
            unique.push(name.as_str());
        }
    }

    if unique.len() > opts.max_streams {
        return Err(WsError::TooManyStreams {
            count: unique.len(),
            max: opts.max_streams,
        });
    }

    let base = base_url.trim_end_matches('/');
    let joined = match opts.encoding {
        UrlEncoding::None => unique.join("/"),
        UrlEncoding::Component => unique
            .iter()
            .map(|name| name.replace('@', "%40"))
            .collect::<Vec<_>>()
            .join("/"),
    };

    Ok(format!("{base}/stream?streams={joined}"))
}

/// Aggregate statistics over a stream-name list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_symbol: BTreeMap<String, usize>,
    /// Names observed at least twice in the input.
    pub duplicates: Vec<String>,
}

/// Compute `StreamStats` for a list of names. Unparseable names count
/// toward `total` and `duplicates` but not the per-type/per-symbol splits.
pub fn stream_stats(names: &[String]) -> StreamStats {
    let mut stats = StreamStats {
        total: names.len(),
        ..Default::default()
    };
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();

    for name in names {
        *counts.entry(name.as_str()).or_default() += 1;
        if let Ok((symbol, kind)) = parse_stream_name(name) {
            *stats
                .by_type
                .entry(kind.data_type().as_str())
                .or_default() += 1;
            *stats.by_symbol.entry(symbol).or_default() += 1;
        }
    }

    stats.duplicates = counts
        .into_iter()
        .filter(|(_, n)| *n >= 2)
        .map(|(name, _)| name.to_string())
        .collect();
    stats
}
