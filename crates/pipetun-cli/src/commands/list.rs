use super::Context;
use crate::registry::TunnelProcessRecord;
use pipetun_proto::format_ports;
use std::collections::HashSet;

/// `pipetun tunnel list`
pub fn list(ctx: &Context) -> anyhow::Result<()> {
    let mut records = collapse_records(ctx.registry.scan().collect());
    if records.is_empty() {
        println!("No tunnels are running");
        return Ok(());
    }
    records.sort_by_key(|record| record.pid);
    print!("{}", render_table(&records));
    Ok(())
}

/// Drop records that are the parent of another record
///
/// A launcher and the process it started both carry the tunnel's arguments;
/// only the one actually serving is shown.
pub fn collapse_records(records: Vec<TunnelProcessRecord>) -> Vec<TunnelProcessRecord> {
    let parents: HashSet<u32> = records.iter().filter_map(|r| r.parent_pid).collect();
    records
        .into_iter()
        .filter(|record| !parents.contains(&record.pid))
        .collect()
}

pub fn render_table(records: &[TunnelProcessRecord]) -> String {
    let header = ["PID", "OWNER", "HOST", "LOCAL PORTS", "REMOTE PORTS", "SSH"].map(String::from);
    let rows: Vec<[String; 6]> = records
        .iter()
        .map(|record| {
            let (host, local, remote, ssh) = match &record.spec {
                Some(spec) => (
                    spec.host_id.clone(),
                    format_ports(&spec.local_ports),
                    format_ports(&spec.remote_ports),
                    if spec.use_ssh {
                        spec.ssh_alias()
                    } else {
                        "-".to_string()
                    },
                ),
                None => ("?".to_string(), "-".to_string(), "-".to_string(), "-".to_string()),
            };
            [
                record.pid.to_string(),
                record.owner.clone(),
                host,
                local,
                remote,
                ssh,
            ]
        })
        .collect();

    let mut widths = header.clone().map(|h| h.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in std::iter::once(&header).chain(rows.iter()) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}
