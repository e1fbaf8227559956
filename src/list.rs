use anyhow::{anyhow, bail, Result};
use svclocal_common::ipc::{ForwardEntry, IpcRequest, IpcResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub async fn execute(ipc_port: u16) -> Result<()> {
    let services = fetch_services(ipc_port).await?;
    print_table(&services);
    Ok(())
}

async fn fetch_services(port: u16) -> Result<Vec<ForwardEntry>> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|_| anyhow!("svclocal daemon not running (start it with `svclocal run`)"))?;

    let (reader, mut writer) = stream.into_split();

    let mut request = serde_json::to_string(&IpcRequest::List)?;
    request.push('\n');
    writer.write_all(request.as_bytes()).await?;

    let mut response_line = String::new();
    BufReader::new(reader).read_line(&mut response_line).await?;

    match serde_json::from_str(&response_line)? {
        IpcResponse::Services { services } => Ok(services),
        IpcResponse::Error { message } => bail!("daemon error: {message}"),
        other => bail!("unexpected response: {other:?}"),
    }
}

fn print_table(entries: &[ForwardEntry]) {
    let header = [
        "NAMESPACE", "NAME", "STATUS", "REASON", "ENDPOINT", "IP ADDRESS", "PORT(S)",
    ];

    let rows: Vec<[String; 7]> = entries
        .iter()
        .map(|e| {
            [
                e.namespace.clone(),
                e.name.clone(),
                capitalize(&e.status.to_string()),
                e.status_reason.clone(),
                or_none(&e.endpoint),
                or_none(&e.ip),
                e.ports.join(","),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    print_row(&header.map(String::from), &widths);
    for row in &rows {
        print_row(row, &widths);
    }
}

fn print_row(cells: &[String; 7], widths: &[usize; 7]) {
    let line = cells
        .iter()
        .zip(widths.iter())
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("   ");
    println!("{}", line.trim_end());
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn or_none(s: &str) -> String {
    if s.is_empty() {
        "None".to_string()
    } else {
        s.to_string()
    }
}
