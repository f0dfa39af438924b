use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use uuid::Uuid;

lazy_static! {
    static ref REGISTRY_STRING: Regex =
        Regex::new(r#"^"(\w+)"=".*?"$"#).expect("Failed to compile REGISTRY_STRING regex");
}

const WINESERVER_FILE: &str = "wineserver";
const MY_FOLDERS: [&str; 4] = ["My Documents", "My Music", "My Pictures", "My Videos"];

/// Replaces the values of the named `"Key"="value"` string entries, keeping
/// every other line byte for byte.
pub fn change_registry(path: &Path, values: &HashMap<&str, String>) -> anyhow::Result<()> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let replacement = REGISTRY_STRING
            .captures(line.trim_end())
            .and_then(|caps| values.get(&caps[1]).map(|v| (caps[1].to_string(), v)));
        match replacement {
            Some((name, value)) => {
                out.push_str(&format!("\"{}\"=\"{}\"\n", name, value));
            }
            None => out.push_str(line),
        }
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

fn braced_guid() -> String {
    format!("{{{}}}", Uuid::new_v4().to_string().to_uppercase())
}

/// Gives a freshly cloned prefix its own machine and user identity.
pub fn regenerate_registry(prefix: &Path) -> anyhow::Result<()> {
    change_registry(
        &prefix.join("system.reg"),
        &HashMap::from([
            ("MachineGuid", Uuid::new_v4().to_string()),
            ("MachineId", braced_guid()),
        ]),
    )?;
    change_registry(
        &prefix.join("user.reg"),
        &HashMap::from([("UserId", braced_guid())]),
    )
}

/// Writes a new random `wine-XXXXXX` server id, read-only for the owner.
pub fn change_wine_server_id(prefix: &Path) -> anyhow::Result<()> {
    let path = prefix.join(WINESERVER_FILE);
    if path.symlink_metadata().is_ok() {
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    fs::write(&path, format!("wine-{}", id))
        .with_context(|| format!("failed to write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o400))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

/// Points the prefix user's personal folders at the server dir.
pub fn relink_my_folders(prefix: &Path, user_name: &str, server_dir: &Path) -> anyhow::Result<()> {
    let user_dir = prefix.join("drive_c").join("users").join(user_name);
    fs::create_dir_all(&user_dir)
        .with_context(|| format!("failed to create {}", user_dir.display()))?;
    for name in MY_FOLDERS {
        let link = user_dir.join(name);
        if let Ok(meta) = link.symlink_metadata() {
            if meta.file_type().is_symlink() {
                fs::remove_file(&link)?;
            }
        }
        std::os::unix::fs::symlink(server_dir, &link)
            .with_context(|| format!("failed to link {}", link.display()))?;
    }
    Ok(())
}
