use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One line of `df` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskEntry {
    pub filesystem: String,
    pub size: String,
    pub used: String,
    pub available: String,
    pub capacity: String,
    pub capacity_percent: Option<u8>,
    pub mount_point: String,
}

/// One line of `ps` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub user: Option<String>,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub vsz: Option<u64>,
    pub rss: Option<u64>,
    pub command: String,
}

/// Split `line` on whitespace into at most `n` columns; the last column keeps
/// the rest of the line, inner spaces included.
fn split_columns(line: &str, n: usize) -> Vec<String> {
    let mut cols = Vec::with_capacity(n);
    let mut rest = line.trim();
    while cols.len() + 1 < n {
        let Some(end) = rest.find(char::is_whitespace) else {
            break;
        };
        cols.push(rest[..end].to_string());
        rest = rest[end..].trim_start();
    }
    if !rest.is_empty() {
        cols.push(rest.to_string());
    }
    cols
}

fn non_empty_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.lines().filter(|l| !l.trim().is_empty())
}

/// Whitespace-aligned table with a header line.
pub fn parse_table(raw: &str) -> Option<Table> {
    let mut lines = non_empty_lines(raw);
    let headers: Vec<String> = lines.next()?.split_whitespace().map(String::from).collect();
    if headers.is_empty() {
        return None;
    }
    let rows: Vec<Vec<String>> = lines.map(|l| split_columns(l, headers.len())).collect();
    if rows.is_empty() {
        return None;
    }
    Some(Table { headers, rows })
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3})%$").expect("percent regex"))
}

/// `df` output on Linux and macOS, with or without inode columns. Filesystem
/// names may contain spaces (`map auto_home`) or wrap onto their own line.
pub fn parse_disk_usage(raw: &str) -> Option<Vec<DiskEntry>> {
    let mut lines = non_empty_lines(raw);
    let header = lines.next()?;
    if !header.trim_start().starts_with("Filesystem") {
        return None;
    }
    let has_inodes = header.contains("iused");

    let mut entries = Vec::new();
    let mut carry: Option<String> = None;
    for line in lines {
        let line = match carry.take() {
            Some(prefix) => format!("{} {}", prefix, line.trim()),
            None => line.trim().to_string(),
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() == 1 {
            carry = Some(line);
            continue;
        }

        let Some(cap_idx) = tokens
            .iter()
            .enumerate()
            .skip(4)
            .find(|(_, t)| percent_re().is_match(t))
            .map(|(i, _)| i)
        else {
            continue;
        };

        let mount_start = if has_inodes { cap_idx + 4 } else { cap_idx + 1 };
        if mount_start >= tokens.len() {
            continue;
        }

        let capacity = tokens[cap_idx].to_string();
        entries.push(DiskEntry {
            filesystem: tokens[..cap_idx - 3].join(" "),
            size: tokens[cap_idx - 3].to_string(),
            used: tokens[cap_idx - 2].to_string(),
            available: tokens[cap_idx - 1].to_string(),
            capacity_percent: percent_re()
                .captures(&capacity)
                .and_then(|c| c[1].parse().ok()),
            capacity,
            mount_point: tokens[mount_start..].join(" "),
        });
    }

    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

/// `ps` output. Columns are located by header name; the command column must
/// be last so its arguments can contain spaces.
pub fn parse_process_table(raw: &str) -> Option<Vec<ProcessEntry>> {
    let mut lines = non_empty_lines(raw);
    let headers: Vec<String> = lines
        .next()?
        .split_whitespace()
        .map(|h| h.to_ascii_uppercase())
        .collect();

    let col = |names: &[&str]| headers.iter().position(|h| names.contains(&h.as_str()));
    let pid_col = col(&["PID"])?;
    let cmd_col = col(&["COMMAND", "COMM", "CMD", "ARGS"])?;
    if cmd_col != headers.len() - 1 {
        return None;
    }
    let user_col = col(&["USER", "UID"]);
    let cpu_col = col(&["%CPU"]);
    let mem_col = col(&["%MEM"]);
    let vsz_col = col(&["VSZ"]);
    let rss_col = col(&["RSS"]);

    let mut entries = Vec::new();
    for line in lines {
        let cols = split_columns(line, headers.len());
        if cols.len() != headers.len() {
            continue;
        }
        let Ok(pid) = cols[pid_col].parse::<u32>() else {
            continue;
        };
        let float = |idx: Option<usize>| {
            idx.and_then(|i| cols[i].parse::<f64>().ok()).unwrap_or(0.0)
        };
        let int = |idx: Option<usize>| idx.and_then(|i| cols[i].parse::<u64>().ok());

        entries.push(ProcessEntry {
            pid,
            user: user_col.map(|i| cols[i].clone()),
            cpu_percent: float(cpu_col),
            mem_percent: float(mem_col),
            vsz: int(vsz_col),
            rss: int(rss_col),
            command: cols[cmd_col].clone(),
        });
    }

    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse, ParsedOutput, ParserKind};

    const DF_LINUX: &str = "\
Filesystem     1K-blocks     Used Available Use% Mounted on
/dev/sda1      102400000 51200000  51200000  50% /
tmpfs            8000000        0   8000000   0% /dev/shm
/dev/mapper/very-long-volume-name
               204800000 10240000 194560000   5% /mnt/data disk
";

    const DF_MACOS: &str = "\
Filesystem     1024-blocks      Used Available Capacity iused      ifree %iused  Mounted on
/dev/disk3s1s1   482797652  10010692 205634192     5%  404167 2056341920    0%   /
map auto_home            0         0         0   100%       0          0     -   /System/Volumes/Data/home
";

    const PS_AUX: &str = "\
USER               PID  %CPU %MEM      VSZ    RSS   TT  STAT STARTED      TIME COMMAND
alice              501  12.5  3.2 412345678 204800   ??  S     9:14AM   1:02.33 /Applications/Safari.app/Contents/MacOS/Safari --flag value
root                 1   0.0  0.1 410000000  12000   ??  Ss    8:00AM   0:30.00 /sbin/launchd
";

    #[test]
    fn generic_table_keeps_trailing_spaces_in_last_column() {
        let t = parse_table("NAME SIZE PATH\na 10 /tmp/a b\nb 20 /tmp/b\n").unwrap();
        assert_eq!(t.headers, vec!["NAME", "SIZE", "PATH"]);
        assert_eq!(t.rows[0], vec!["a", "10", "/tmp/a b"]);
        assert_eq!(t.rows.len(), 2);
    }

    #[test]
    fn header_only_table_degrades() {
        assert!(parse(&ParserKind::Table, "NAME SIZE\n").is_text());
        assert!(parse(&ParserKind::Table, "").is_text());
    }

    #[test]
    fn linux_df() {
        let entries = parse_disk_usage(DF_LINUX).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].filesystem, "/dev/sda1");
        assert_eq!(entries[0].capacity_percent, Some(50));
        assert_eq!(entries[0].mount_point, "/");
        assert_eq!(entries[2].filesystem, "/dev/mapper/very-long-volume-name");
        assert_eq!(entries[2].available, "194560000");
        assert_eq!(entries[2].mount_point, "/mnt/data disk");
    }

    #[test]
    fn macos_df_with_inodes() {
        let entries = parse_disk_usage(DF_MACOS).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, "482797652");
        assert_eq!(entries[0].capacity, "5%");
        assert_eq!(entries[0].mount_point, "/");
        assert_eq!(entries[1].filesystem, "map auto_home");
        assert_eq!(entries[1].mount_point, "/System/Volumes/Data/home");
    }

    #[test]
    fn df_malformed_degrades() {
        assert!(parse(&ParserKind::DiskUsage, "df: /nope: No such file or directory").is_text());
        assert!(parse(&ParserKind::DiskUsage, "Filesystem Size\ngarbage line here").is_text());
    }

    #[test]
    fn ps_aux() {
        match parse(&ParserKind::ProcessTable, PS_AUX) {
            ParsedOutput::ProcessTable { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].pid, 501);
                assert_eq!(entries[0].user.as_deref(), Some("alice"));
                assert_eq!(entries[0].cpu_percent, 12.5);
                assert_eq!(entries[0].mem_percent, 3.2);
                assert_eq!(entries[0].rss, Some(204800));
                assert_eq!(
                    entries[0].command,
                    "/Applications/Safari.app/Contents/MacOS/Safari --flag value"
                );
                assert_eq!(entries[1].command, "/sbin/launchd");
            }
            other => panic!("expected process table, got {:?}", other),
        }
    }

    #[test]
    fn ps_custom_columns() {
        let entries = parse_process_table("  PID COMM\n  42 /usr/bin/top\n").unwrap();
        assert_eq!(entries[0].pid, 42);
        assert_eq!(entries[0].user, None);
        assert_eq!(entries[0].cpu_percent, 0.0);
    }

    #[test]
    fn ps_malformed_degrades() {
        assert!(parse(&ParserKind::ProcessTable, "ps: illegal option -- z").is_text());
        // Command column must be last
        assert!(parse_process_table("PID COMMAND USER\n1 init root\n").is_none());
    }
}
