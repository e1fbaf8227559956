use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::ProxyError;

const BEGIN_MARKER: &str = "# BEGIN svclocal";
const END_MARKER: &str = "# END svclocal";

/// Read-modify-write editor for the managed section of the hosts file.
///
/// Content outside the marker lines is carried verbatim; each managed IP
/// occupies exactly one `<ip>\t<name> <name>…` line inside the section.
/// Nothing touches disk until [`HostsFile::save`], which writes the whole
/// file atomically (temp file in the same directory, then rename).
pub struct HostsFile {
    path: PathBuf,
    before: String,
    after: String,
    entries: Vec<(IpAddr, Vec<String>)>,
}

impl HostsFile {
    /// Opens the platform's hosts file.
    pub fn system() -> Result<Self, ProxyError> {
        Self::load(system_hosts_path())
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ProxyError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;

        let (before, section, after) = split_sections(&content);
        let entries = section
            .lines()
            .filter_map(parse_entry)
            .collect();

        Ok(Self {
            path,
            before: before.to_string(),
            after: after.to_string(),
            entries,
        })
    }

    /// Sets the single managed line for `ip`, replacing any existing one.
    pub fn add_hosts(&mut self, ip: IpAddr, names: &[String]) {
        if let Some(entry) = self.entries.iter_mut().find(|(e, _)| *e == ip) {
            entry.1 = names.to_vec();
        } else {
            self.entries.push((ip, names.to_vec()));
        }
    }

    /// Deletes the managed line for `ip`, if any.
    pub fn remove_address(&mut self, ip: IpAddr) {
        self.entries.retain(|(e, _)| *e != ip);
    }

    pub fn managed_entries(&self) -> &[(IpAddr, Vec<String>)] {
        &self.entries
    }

    /// Persists the file. The unmanaged portions are written back
    /// byte-for-byte; an empty managed set emits no markers at all, so an
    /// add followed by a remove leaves the on-disk file unchanged.
    pub fn save(&self) -> Result<(), ProxyError> {
        let content = self.render();

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), content)?;
        #[cfg(unix)]
        {
            // The rename replaces the inode; hosts must stay world-readable.
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| ProxyError::Io(e.error))?;

        Ok(())
    }

    fn render(&self) -> String {
        if self.entries.is_empty() {
            return format!("{}{}", self.before, self.after);
        }

        let mut out = self.before.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(BEGIN_MARKER);
        out.push('\n');
        for (ip, names) in &self.entries {
            out.push_str(&format!("{}\t{}\n", ip, names.join(" ")));
        }
        out.push_str(END_MARKER);
        out.push('\n');
        out.push_str(&self.after);
        out
    }
}

fn system_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// Splits file content into (before, managed section body, after).
fn split_sections(content: &str) -> (&str, &str, &str) {
    let Some(begin) = content.find(BEGIN_MARKER) else {
        return (content, "", "");
    };
    let section_start = match content[begin..].find('\n') {
        Some(nl) => begin + nl + 1,
        None => content.len(),
    };
    let Some(end_rel) = content[section_start..].find(END_MARKER) else {
        return (content, "", "");
    };
    let end = section_start + end_rel;
    let after_start = match content[end..].find('\n') {
        Some(nl) => end + nl + 1,
        None => content.len(),
    };
    (
        &content[..begin],
        &content[section_start..end],
        &content[after_start..],
    )
}

fn parse_entry(line: &str) -> Option<(IpAddr, Vec<String>)> {
    let mut parts = line.split_whitespace();
    let ip = parts.next()?.parse().ok()?;
    let names: Vec<String> = parts.map(str::to_string).collect();
    if names.is_empty() {
        return None;
    }
    Some((ip, names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn fixture(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn add_then_remove_is_a_no_op_on_disk() {
        let original = "127.0.0.1 localhost\n::1 localhost\n";
        let (_dir, path) = fixture(original);

        let mut hosts = HostsFile::load(&path).unwrap();
        hosts.add_hosts(ip("127.0.0.2"), &["api".into(), "api.default".into()]);
        hosts.save().unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), original);

        hosts.remove_address(ip("127.0.0.2"));
        hosts.save().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn managed_line_shape_and_placement() {
        let (_dir, path) = fixture("127.0.0.1 localhost\n");

        let mut hosts = HostsFile::load(&path).unwrap();
        hosts.add_hosts(ip("127.0.0.2"), &["api".into(), "api.default".into()]);
        hosts.save().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "127.0.0.1 localhost\n# BEGIN svclocal\n127.0.0.2\tapi api.default\n# END svclocal\n"
        );
    }

    #[test]
    fn add_replaces_the_line_for_an_existing_ip() {
        let (_dir, path) = fixture("\n");

        let mut hosts = HostsFile::load(&path).unwrap();
        hosts.add_hosts(ip("127.0.0.2"), &["old".into()]);
        hosts.add_hosts(ip("127.0.0.2"), &["new".into(), "new.ns".into()]);
        hosts.save().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.matches("127.0.0.2").count(), 1);
        assert!(written.contains("127.0.0.2\tnew new.ns"));
        assert!(!written.contains("old"));
    }

    #[test]
    fn content_after_the_section_survives_edits() {
        let original = "# head\n# BEGIN svclocal\n127.0.0.2\tapi\n# END svclocal\n# tail\n";
        let (_dir, path) = fixture(original);

        let mut hosts = HostsFile::load(&path).unwrap();
        assert_eq!(hosts.managed_entries().len(), 1);

        hosts.add_hosts(ip("127.0.0.3"), &["db".into()]);
        hosts.save().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# head\n"));
        assert!(written.ends_with("# tail\n"));
        assert!(written.contains("127.0.0.2\tapi\n127.0.0.3\tdb\n"));
    }

    #[test]
    fn emptying_the_section_drops_the_markers() {
        let original = "x\n# BEGIN svclocal\n127.0.0.2\tapi\n# END svclocal\ny\n";
        let (_dir, path) = fixture(original);

        let mut hosts = HostsFile::load(&path).unwrap();
        hosts.remove_address(ip("127.0.0.2"));
        hosts.save().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x\ny\n");
    }

    #[test]
    fn file_without_trailing_newline_gets_one_before_the_section() {
        let (_dir, path) = fixture("127.0.0.1 localhost");

        let mut hosts = HostsFile::load(&path).unwrap();
        hosts.add_hosts(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), &["api".into()]);
        hosts.save().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("127.0.0.1 localhost\n# BEGIN svclocal\n"));

        hosts.remove_address(ip("127.0.0.2"));
        hosts.save().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1 localhost");
    }
}
