use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use sha2::{Digest, Sha256};

use dsfleet_protocol::management::instance::WorldInfo;

use crate::error::FleetError;
use crate::provision::factory::Provisioner;
use crate::storage::files::{sha1_hex, write_text};

lazy_static! {
    static ref ASTEROID: Regex = Regex::new(r"^<StorageName>(.*?Asteroid.*?)</StorageName>")
        .expect("Failed to compile ASTEROID regex");
}

const SANDBOX_SBS: &str = "SANDBOX_0_0_0_.sbs";
const CHECKSUM_FILE: &str = "checksum.txt";

pub fn load_world(path: &Path) -> anyhow::Result<WorldInfo> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid world file {}", path.display()))
}

/// Extracts a world archive into the server dir and checks it carries `world.json`.
pub fn extract_world(
    provisioner: &dyn Provisioner,
    server_dir: &Path,
    archive: &Path,
) -> anyhow::Result<()> {
    provisioner.unzip(server_dir, archive)?;
    if !server_dir.join("world.json").is_file() {
        return Err(FleetError::validation(format!(
            "Invalid world archive (missing world.json file): {}",
            archive.display()
        ))
        .into());
    }
    Ok(())
}

/// Voxel storages the world refers to, in file order.
pub fn referenced_asteroids(world_dir: &Path) -> anyhow::Result<Vec<String>> {
    let path = world_dir.join(SANDBOX_SBS);
    let file = fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut names = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(caps) = ASTEROID.captures(line.trim()) {
            names.push(caps[1].to_string());
        }
    }
    Ok(names)
}

/// Copies each referenced asteroid's `.vx2` file from the shared assets when the world lacks it.
pub fn deploy_asteroids(world_dir: &Path, assets_dir: &Path) -> anyhow::Result<usize> {
    let mut deployed = 0;
    for name in referenced_asteroids(world_dir)? {
        let file_name = format!("{}.vx2", name);
        let dst = world_dir.join(&file_name);
        if dst.exists() {
            continue;
        }
        let src = assets_dir.join(&file_name);
        fs::copy(&src, &dst).with_context(|| format!("missing asteroid asset {}", src.display()))?;
        deployed += 1;
    }
    if deployed > 0 {
        debug!("deployed {} asteroids into {}", deployed, world_dir.display());
    }
    Ok(deployed)
}

/// Unpacks each plugin bundle into its own folder under `plugins_dir`.
pub fn extract_plugins(
    provisioner: &dyn Provisioner,
    plugins: &[String],
    bundles_dir: &Path,
    plugins_dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(plugins_dir)
        .with_context(|| format!("failed to create {}", plugins_dir.display()))?;
    let mut extracted = Vec::with_capacity(plugins.len());
    for name in plugins {
        let dir = plugins_dir.join(name);
        fs::create_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let bundle = bundles_dir.join(format!("{}.zip", name));
        provisioner
            .unzip(&dir, &bundle)
            .with_context(|| format!("failed to extract plugin {}", name))?;
        extracted.push(dir);
    }
    Ok(extracted)
}

/// SHA-256 over a `sha1sum`-style listing of the save files, stored next to them.
pub fn checksum_world(world_dir: &Path, files: &[String]) -> anyhow::Result<String> {
    let mut listing = String::new();
    for name in files {
        let sha1 = sha1_hex(&world_dir.join(name))
            .with_context(|| format!("failed to hash {}", name))?;
        listing.push_str(&format!("{}  {}\n", sha1, name));
    }
    let checksum = format!("{:x}", Sha256::digest(listing.as_bytes()));
    write_text(&world_dir.join(CHECKSUM_FILE), &checksum)
        .context("failed to write world checksum")?;
    info!("world checksum {}", checksum);
    Ok(checksum)
}
