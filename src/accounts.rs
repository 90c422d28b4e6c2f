//! Locally stored Steam account identifiers.
//!
//! Steam keeps every account that has logged in on this machine in
//! `<install>/config/loginusers.vdf`, a brace-delimited key/value file:
//!
//! ```text
//! "users"
//! {
//!     "76561198000000001"
//!     {
//!         "AccountName"    "someone"
//!         "PersonaName"    "Someone"
//!     }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const ACCOUNT_NAME_KEY: &str = "AccountName";
const DISPLAY_NAME_KEY: &str = "PersonaName";

// Quoted strings inside a block may carry braces, e.g. a "{Clan} Name" persona.
static USER_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(\d+)"\s*\{((?:"(?:[^"\\]|\\.)*"|[^{}"])*)\}"#)
        .expect("user block pattern is valid")
});
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""((?:[^"\\]|\\.)*)"\s*"((?:[^"\\]|\\.)*)""#)
        .expect("key/value pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentifier {
    #[serde(rename = "steam_id")]
    pub account_id: String,
    pub account_name: String,
    #[serde(rename = "persona_name")]
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Steam install directory could not be located")]
    InstallNotFound,
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Producer of the account snapshot merged into every flush.
pub trait AccountSource: Send + Sync {
    fn load(&self) -> Result<Vec<AccountIdentifier>, AccountError>;
}

#[derive(Debug, Clone, Default)]
pub struct SteamAccounts {
    install_override: Option<PathBuf>,
}

impl SteamAccounts {
    pub fn new(install_override: Option<PathBuf>) -> Self {
        Self { install_override }
    }

    pub fn login_users_path(&self) -> Result<PathBuf, AccountError> {
        let install = match &self.install_override {
            Some(path) => path.clone(),
            None => steam_install_dir().ok_or(AccountError::InstallNotFound)?,
        };
        Ok(install.join("config").join("loginusers.vdf"))
    }
}

impl AccountSource for SteamAccounts {
    fn load(&self) -> Result<Vec<AccountIdentifier>, AccountError> {
        let path = self.login_users_path()?;
        read_accounts(&path)
    }
}

pub fn read_accounts(path: &Path) -> Result<Vec<AccountIdentifier>, AccountError> {
    debug!(path = %path.display(), "reading Steam login users");
    let content = fs::read_to_string(path).map_err(|source| AccountError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let accounts = extract(&content);
    if accounts.is_empty() {
        info!(path = %path.display(), "no Steam accounts found");
    }
    Ok(accounts)
}

/// Pulls one record out of every numeric-keyed block. Blocks missing a field
/// are skipped on their own.
pub fn extract(content: &str) -> Vec<AccountIdentifier> {
    let mut accounts = Vec::new();
    for block in USER_BLOCK.captures_iter(content) {
        let (_, [account_id, body]) = block.extract();

        let mut account_name = None;
        let mut display_name = None;
        for pair in KEY_VALUE.captures_iter(body) {
            let (_, [key, value]) = pair.extract();
            if key.eq_ignore_ascii_case(ACCOUNT_NAME_KEY) {
                account_name = Some(unescape(value));
            } else if key.eq_ignore_ascii_case(DISPLAY_NAME_KEY) {
                display_name = Some(unescape(value));
            }
        }

        match (account_name, display_name) {
            (Some(account_name), Some(display_name)) => accounts.push(AccountIdentifier {
                account_id: account_id.to_string(),
                account_name,
                display_name,
            }),
            _ => warn!(account_id, "skipping Steam user block with missing fields"),
        }
    }
    accounts
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(windows)]
fn steam_install_dir() -> Option<PathBuf> {
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::System::Registry::{HKEY_CURRENT_USER, RRF_RT_REG_SZ, RegGetValueW};
    use windows::core::w;

    let mut size = 0u32;
    let status = unsafe {
        RegGetValueW(
            HKEY_CURRENT_USER,
            w!("SOFTWARE\\Valve\\Steam"),
            w!("SteamPath"),
            RRF_RT_REG_SZ,
            None,
            None,
            Some(&mut size as *mut u32),
        )
    };
    if status != ERROR_SUCCESS || size == 0 {
        debug!(status = status.0, "SteamPath registry value unavailable");
        return None;
    }

    let mut buf = vec![0u16; usize::try_from(size).ok()?.div_ceil(2)];
    let status = unsafe {
        RegGetValueW(
            HKEY_CURRENT_USER,
            w!("SOFTWARE\\Valve\\Steam"),
            w!("SteamPath"),
            RRF_RT_REG_SZ,
            None,
            Some(buf.as_mut_ptr().cast::<std::ffi::c_void>()),
            Some(&mut size as *mut u32),
        )
    };
    if status != ERROR_SUCCESS {
        debug!(status = status.0, "failed to read SteamPath registry value");
        return None;
    }

    let len = buf.iter().position(|unit| *unit == 0).unwrap_or(buf.len());
    let raw = String::from_utf16_lossy(&buf[..len]);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Steam writes the value with forward slashes.
    Some(PathBuf::from(trimmed.replace('/', "\\")))
}

#[cfg(not(windows))]
fn steam_install_dir() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    [
        home.join(".steam").join("steam"),
        home.join(".local").join("share").join("Steam"),
    ]
    .into_iter()
    .find(|candidate| candidate.join("config").is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOGIN_USERS: &str = r#""users"
{
	"76561198000000001"
	{
		"AccountName"		"alpha"
		"PersonaName"		"Alpha \"A\" One"
		"RememberPassword"		"1"
		"MostRecent"		"1"
		"Timestamp"		"1700000000"
	}
	"76561198000000002"
	{
		"AccountName"		"beta"
		"PersonaName"		"Beta"
	}
}
"#;

    #[test]
    fn extracts_every_complete_user_block() {
        let accounts = extract(LOGIN_USERS);

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account_id, "76561198000000001");
        assert_eq!(accounts[0].account_name, "alpha");
        assert_eq!(accounts[0].display_name, "Alpha \"A\" One");
        assert_eq!(accounts[1].account_name, "beta");
    }

    #[test]
    fn block_missing_a_field_is_skipped_without_losing_others() {
        let content = r#""users"
{
	"1"
	{
		"AccountName"		"lonely"
	}
	"2"
	{
		"AccountName"		"whole"
		"PersonaName"		"Whole"
	}
}"#;

        let accounts = extract(content);
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id, "2");
    }

    #[test]
    fn braces_inside_quoted_values_keep_the_block() {
        let content = r#""users"
{
	"76561198000000001"
	{
		"AccountName"		"alpha"
		"PersonaName"		"{Clan} Alpha"
	}
	"76561198000000002"
	{
		"AccountName"		"beta"
		"PersonaName"		"Beta }{"
	}
}"#;

        let accounts = extract(content);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account_id, "76561198000000001");
        assert_eq!(accounts[0].display_name, "{Clan} Alpha");
        assert_eq!(accounts[1].display_name, "Beta }{");
    }

    #[test]
    fn content_without_user_blocks_yields_empty_result() {
        assert!(extract("\"users\"\n{\n}\n").is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let tmp = TempDir::new().expect("temp dir");
        let err = read_accounts(&tmp.path().join("loginusers.vdf")).expect_err("missing file");
        assert!(matches!(err, AccountError::Read { .. }));
    }

    #[test]
    fn install_override_points_at_config_file() {
        let tmp = TempDir::new().expect("temp dir");
        let config_dir = tmp.path().join("config");
        fs::create_dir_all(&config_dir).expect("config dir");
        fs::write(config_dir.join("loginusers.vdf"), LOGIN_USERS).expect("write vdf");

        let source = SteamAccounts::new(Some(tmp.path().to_path_buf()));
        assert_eq!(
            source.login_users_path().expect("path"),
            config_dir.join("loginusers.vdf")
        );
        assert_eq!(source.load().expect("load").len(), 2);
    }

    #[test]
    fn serialized_accounts_use_steam_field_names() {
        let account = AccountIdentifier {
            account_id: "1".to_string(),
            account_name: "alpha".to_string(),
            display_name: "Alpha".to_string(),
        };
        let json = serde_json::to_value(&account).expect("serialize");
        assert_eq!(json["steam_id"], "1");
        assert_eq!(json["account_name"], "alpha");
        assert_eq!(json["persona_name"], "Alpha");
    }
}
