//! Turns raw `status` output into a typed [`ServerStatus`]. Both engine
//! families are tolerated in one pass: GoldSource prints
//! `hostname:`/`players : N (M max)`/`fps:` style lines, Source prints
//! `Server Name:`/`Players: N/M`. Unparseable fields fall back to defaults
//! rather than failing the capture.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::models::{ServerStatus, StatusPlayer};

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:hostname|server\s+name)\s*:\s*(.+)$").expect("hostname regex")
});

static MAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*map\s*:?\s+(\S+)").expect("map regex"));

static PLAYERS_GOLDSRC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)players\s*:\s*(\d+)\s*(?:active)?\s*\((\d+)\s*max\)").expect("players regex")
});

static PLAYERS_SOURCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)players\s*:\s*(\d+)\s*/\s*(\d+)").expect("players regex"));

static UPTIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*up(?:time)?\s*:?\s+([\d:]+)").expect("uptime regex"));

static FPS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfps\s*:?\s+([\d.]+)").expect("fps regex"));

static CPU_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcpu\s*:?\s+([\d.]+)").expect("cpu regex"));

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*version\s*:?\s+(.+)$").expect("version regex"));

// `# <userid> "<name>" <uniqueid> <time> <ping> <loss> <state>`
static PLAYER_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^#\s*(?P<userid>\d+)\s+"(?P<name>[^"]*)"\s+(?P<uniqueid>\S+)\s+(?P<time>[\d:]+)\s+(?P<ping>\d+)\s+(?P<loss>\d+)\s+(?P<state>\S+)"#)
        .expect("player line regex")
});

pub fn parse_status(raw: &str) -> ServerStatus {
    let hostname = HOSTNAME_RE
        .captures(raw)
        .map(|c| c[1].trim().to_owned())
        .filter(|h| !h.is_empty());

    let map = MAP_RE
        .captures(raw)
        .map(|c| c[1].trim().to_owned())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "unknown".to_owned());

    let (players, max_players) = PLAYERS_GOLDSRC_RE
        .captures(raw)
        .or_else(|| PLAYERS_SOURCE_RE.captures(raw))
        .map(|c| {
            (
                c[1].parse().unwrap_or(0u32),
                c[2].parse().unwrap_or(0u32),
            )
        })
        .unwrap_or((0, 0));

    let uptime_seconds = UPTIME_RE
        .captures(raw)
        .map(|c| parse_clock(&c[1]))
        .unwrap_or(0);

    let fps = FPS_RE
        .captures(raw)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0.0);

    let cpu = CPU_RE.captures(raw).and_then(|c| c[1].parse().ok());

    let version = VERSION_RE.captures(raw).map(|c| c[1].trim().to_owned());

    let mut player_list = Vec::new();
    let mut bot_count = 0u32;
    let mut real_player_count = 0u32;
    for line in raw.lines().filter(|l| l.trim_start().starts_with('#')) {
        let Some(captures) = PLAYER_LINE_RE.captures(line) else {
            trace!("Skipping unparseable player line: {}", line);
            continue;
        };
        let Ok(game_user_id) = captures["userid"].parse::<i64>() else {
            continue;
        };
        let is_bot = line.contains("BOT");
        if is_bot {
            bot_count += 1;
        } else {
            real_player_count += 1;
        }
        player_list.push(StatusPlayer {
            game_user_id,
            name: captures["name"].to_owned(),
            unique_id: captures["uniqueid"].to_owned(),
            time: captures["time"].to_owned(),
            ping: captures["ping"].parse().unwrap_or(0),
            loss: captures["loss"].parse().unwrap_or(0),
            state: captures["state"].to_owned(),
            is_bot,
        });
    }

    let has_players = !player_list.is_empty();
    ServerStatus {
        map,
        players,
        max_players,
        uptime_seconds,
        fps,
        hostname,
        version,
        cpu,
        player_list: has_players.then_some(player_list),
        real_player_count: has_players.then_some(real_player_count),
        bot_count: has_players.then_some(bot_count),
        timestamp: Utc::now(),
    }
}

/// `H:M:S`, `M:S`, or a bare number of minutes.
fn parse_clock(text: &str) -> u64 {
    let parts: Vec<&str> = text.split(':').collect();
    let nums: Vec<u64> = parts.iter().map(|p| p.parse().unwrap_or(0)).collect();
    match nums.as_slice() {
        [h, m, s] => h * 3600 + m * 60 + s,
        [m, s] => m * 60 + s,
        [m] => m * 60,
        _ => 0,
    }
}
