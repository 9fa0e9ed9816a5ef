use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use tracing::debug;

use crate::config::ProxyEndpoint;
use crate::error::{PatcherError, Result};

/// Config record inside a decoded APK.
pub const ANDROID_CONFIG_PATH: &str = "assets/auto_proxy/config.properties";
/// Resource bundle inside `<App>.app` that holds the iOS config and cert.
pub const IOS_BUNDLE_PATH: &str = "Frameworks/AutoProxy.framework/AutoProxy.bundle";
pub const IOS_CONFIG_NAME: &str = "proxy_config.plist";

const PROPERTIES_HEADER: &str = "Auto Proxy baked-in configuration";
const HOST_KEY: &str = "host";
const PORT_KEY: &str = "port";
const PLIST_HOST_KEY: &str = "ProxyHost";
const PLIST_PORT_KEY: &str = "ProxyPort";

/// Write `entries` as a Java properties file, replacing any existing file.
pub fn write_properties(path: &Path, comment: &str, entries: &[(&str, &str)]) -> Result<()> {
    let mut out = String::new();
    for line in comment.lines() {
        out.push_str("# ");
        out.push_str(line);
        out.push('\n');
    }
    for (key, value) in entries {
        out.push_str(&escape(key, true));
        out.push('=');
        out.push_str(&escape(value, false));
        out.push('\n');
    }

    ensure_parent(path)?;
    fs::write(path, out).map_err(|e| PatcherError::from_io_error(path, e))
}

/// Parse a properties file written by [`write_properties`].
///
/// Handles comments, `=`/`:` separators and backslash escapes. Line
/// continuations are not supported.
pub fn read_properties(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path).map_err(|e| PatcherError::from_io_error(path, e))?;
    let mut map = BTreeMap::new();

    for raw in text.lines() {
        let line = raw.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let mut key = String::new();
        let mut chars = line.chars();
        let mut escaped = false;
        for c in chars.by_ref() {
            if escaped {
                key.push(unescape_char(c));
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '=' || c == ':' || c.is_whitespace() {
                break;
            } else {
                key.push(c);
            }
        }

        let rest = chars.as_str().trim_start();
        let rest = rest
            .strip_prefix('=')
            .or_else(|| rest.strip_prefix(':'))
            .unwrap_or(rest)
            .trim_start();
        map.insert(key, unescape(rest));
    }
    Ok(map)
}

fn escape(s: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_char(c: char) -> char {
    match c {
        't' => '\t',
        'n' => '\n',
        'r' => '\r',
        other => other,
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(unescape_char(next));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PatcherError::from_io_error(parent, e))?;
    }
    Ok(())
}

/// `assets/auto_proxy/config.properties` inside the decoded APK.
pub fn write_android_config(decoded_dir: &Path, proxy: &ProxyEndpoint) -> Result<PathBuf> {
    let path = decoded_dir.join(ANDROID_CONFIG_PATH);
    let port = proxy.port.to_string();
    write_properties(
        &path,
        PROPERTIES_HEADER,
        &[(HOST_KEY, proxy.host.as_str()), (PORT_KEY, port.as_str())],
    )?;
    debug!(path = %path.display(), "wrote proxy config");
    Ok(path)
}

/// `proxy_config.plist` inside the framework's resource bundle.
pub fn write_ios_config(app_dir: &Path, proxy: &ProxyEndpoint) -> Result<PathBuf> {
    let path = app_dir.join(IOS_BUNDLE_PATH).join(IOS_CONFIG_NAME);
    ensure_parent(&path)?;

    let mut dict = Dictionary::new();
    dict.insert(PLIST_HOST_KEY.into(), Value::String(proxy.host.clone()));
    dict.insert(PLIST_PORT_KEY.into(), Value::Integer(i64::from(proxy.port).into()));
    Value::Dictionary(dict)
        .to_file_xml(&path)
        .map_err(|e| PatcherError::from_plist_error(&path, e))?;
    debug!(path = %path.display(), "wrote proxy config");
    Ok(path)
}
