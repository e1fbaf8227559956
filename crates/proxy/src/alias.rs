//! Loopback alias management.
//!
//! Linux routes all of 127.0.0.0/8 through `lo`, so binding any loopback
//! address just works. macOS only routes 127.0.0.1 and needs an explicit
//! `ifconfig lo0 alias` per additional address.

use std::net::Ipv4Addr;

use tokio::process::Command;

use crate::error::ProxyError;

/// When set to a non-empty value, alias add/remove both become no-ops.
pub const DISABLE_LOOPBACK_ALIAS_ENV: &str = "DISABLE_LOOPBACK_ALIAS";

/// Whether this platform needs explicit loopback aliases at all.
pub fn required() -> bool {
    cfg!(target_os = "macos")
}

pub fn disabled() -> bool {
    std::env::var_os(DISABLE_LOOPBACK_ALIAS_ENV).is_some_and(|v| !v.is_empty())
}

/// True when the worker should add/remove aliases for allocated IPs.
pub fn active() -> bool {
    required() && !disabled()
}

pub async fn add(ip: Ipv4Addr) -> Result<(), ProxyError> {
    ifconfig(&["lo0", "alias", &ip.to_string(), "up"]).await
}

pub async fn remove(ip: Ipv4Addr) -> Result<(), ProxyError> {
    ifconfig(&["lo0", "-alias", &ip.to_string()]).await
}

async fn ifconfig(args: &[&str]) -> Result<(), ProxyError> {
    let output = Command::new("ifconfig").args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProxyError::Alias(format!(
            "ifconfig {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_disables_aliasing() {
        std::env::remove_var(DISABLE_LOOPBACK_ALIAS_ENV);
        assert!(!disabled());

        std::env::set_var(DISABLE_LOOPBACK_ALIAS_ENV, "1");
        assert!(disabled());
        assert!(!active());

        std::env::set_var(DISABLE_LOOPBACK_ALIAS_ENV, "");
        assert!(!disabled());

        std::env::remove_var(DISABLE_LOOPBACK_ALIAS_ENV);
    }
}
