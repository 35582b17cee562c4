//! The management command surface.
//!
//! One line in, one result out. Commands mirror the management
//! protocol: ban CRUD, server lifecycle, and a couple of debug knobs.
//! `-j` switches list-style output to JSON.

use crate::cache::ban_build::BanProto;
use crate::server::Server;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Param(String),
    #[error("{0}")]
    Cant(String),
    #[error("Unknown command \"{0}\"")]
    Unknown(String),
}

/// Build a ban proto from `field oper literal [&& ...]` argument lists.
fn ban_proto_build(server: &Server, av: &[&str]) -> Result<BanProto, CliError> {
    if av.len() % 4 != 3 {
        return Err(CliError::Param("Wrong number of arguments".into()));
    }
    for i in (3..av.len()).step_by(4) {
        if av[i] != "&&" {
            return Err(CliError::Param(format!(
                "Found \"{}\" expected &&",
                av[i]
            )));
        }
    }
    let mut proto = server.cache.ban_build();
    for i in (0..av.len()).step_by(4) {
        proto
            .add_test(av[i], av[i + 1], av[i + 2])
            .map_err(|e| CliError::Param(e.to_string()))?;
    }
    Ok(proto)
}

fn cmd_ban(server: &Server, av: &[&str]) -> Result<String, CliError> {
    let proto = ban_proto_build(server, av)?;
    server
        .cache
        .ban_commit(proto)
        .map_err(|e| CliError::Param(e.to_string()))?;
    Ok(String::new())
}

fn cmd_ban_cancel(server: &Server, av: &[&str]) -> Result<String, CliError> {
    let json_out = av.first() == Some(&"-j");
    let av = if json_out { &av[1..] } else { av };
    let proto = ban_proto_build(server, av)?;
    let dups = server
        .cache
        .ban_cancel(proto)
        .map_err(|e| CliError::Cant(e.to_string()))?;
    if json_out {
        Ok(json!({ "cancelled": dups }).to_string())
    } else {
        Ok(format!("Bans cancelled: {dups}\n"))
    }
}

fn cmd_ban_list(server: &Server, av: &[&str]) -> Result<String, CliError> {
    let json_out = av.first() == Some(&"-j");
    let (bans, pinned_tail) = server.cache.ban_list_pinned();
    let debug_lurker = server.params.read().debug_lurker;

    let out = if json_out {
        let mut entries = Vec::new();
        for b in &bans {
            // the pin itself must not show up in the counts
            let o = if std::sync::Arc::ptr_eq(b, &pinned_tail) { 1 } else { 0 };
            let mut e = json!({
                "time": b.time(),
                "refs": *b.refcount.lock() - o,
                "completed": b.is_completed(),
                "spec": b.render(),
            });
            if debug_lurker {
                e["req_tests"] = json!(b.is_req());
                e["objcores"] = json!(b.objcore.lock().len());
            }
            entries.push(e);
        }
        serde_json::to_string_pretty(&entries).expect("ban list serialises")
    } else {
        let mut out = String::from("Present bans:\n");
        for b in &bans {
            let o = if std::sync::Arc::ptr_eq(b, &pinned_tail) { 1 } else { 0 };
            out.push_str(&format!(
                "{:17.6} {:5} {}",
                b.time(),
                *b.refcount.lock() - o,
                if b.is_completed() { "C" } else { "-" },
            ));
            if debug_lurker {
                out.push_str(&format!(
                    "{} {:4}",
                    if b.is_req() { "R" } else { "-" },
                    b.objcore.lock().len(),
                ));
            }
            out.push_str("  ");
            out.push_str(&b.render());
            out.push('\n');
        }
        out
    };

    server.cache.ban_list_unpin(pinned_tail);
    Ok(out)
}

fn cmd_status(server: &Server, av: &[&str]) -> Result<String, CliError> {
    let running = server.is_running();
    let started = chrono::DateTime::from_timestamp(server.t_start() as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    if av.first() == Some(&"-j") {
        let mut v = server.stats.snapshot_json();
        v["running"] = json!(running);
        v["started"] = json!(started);
        Ok(serde_json::to_string_pretty(&v).expect("status serialises"))
    } else if running {
        Ok(format!("Child in state running (since {started})\n"))
    } else {
        Ok("Child in state stopped\n".into())
    }
}

fn cmd_listen_address(server: &Server) -> Result<String, CliError> {
    let addrs = server
        .acceptor
        .listen_addresses()
        .map_err(|e| CliError::Cant(e.to_string()))?;
    let mut out = String::new();
    for (name, addr) in addrs {
        match addr.rsplit_once(':') {
            Some((ip, port)) => out.push_str(&format!("{name} {ip} {port}\n")),
            None => out.push_str(&format!("{name} {addr} -\n")),
        }
    }
    Ok(out)
}

/// Dispatch one management command line.
pub fn dispatch(server: &Server, line: &str) -> Result<String, CliError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let (cmd, av) = match words.split_first() {
        Some((c, rest)) => (*c, rest),
        None => return Ok(String::new()),
    };

    match cmd {
        "ban" => cmd_ban(server, av),
        "ban.list" => cmd_ban_list(server, av),
        "ban.cancel" => cmd_ban_cancel(server, av),
        "start" => match server.start() {
            Ok(()) => Ok(String::new()),
            Err(e) => Err(CliError::Cant(e.to_string())),
        },
        "stop" => match server.stop() {
            Ok(()) => Ok(String::new()),
            Err(e) => Err(CliError::Cant(e.to_string())),
        },
        "status" => cmd_status(server, av),
        "pid" => Ok(format!("{}\n", std::process::id())),
        "listen.address" => cmd_listen_address(server),
        "debug.reqpoolfail" => match av.first() {
            Some(pattern) => {
                server.pools.set_reqpoolfail(pattern);
                Ok(String::new())
            }
            None => Err(CliError::Param("Missing pattern".into())),
        },
        other => Err(CliError::Unknown(other.to_string())),
    }
}
