use std::fs;
use std::io::Write;

use camino::Utf8Path;
use serde::Serialize;

use crate::error::PackError;
use crate::plan::{DownloadItem, RASTERS_GEOTIFF_DIR, VECTORS_GEOJSON_DIR, VECTORS_KML_DIR};

pub const MANIFEST_FILE: &str = "manifest.csv";
pub const README_FILE: &str = "README.md";

/// One manifest line, derived from the planned item plus current disk state.
/// Disk is authoritative for existence and size; the manifest is a snapshot,
/// never a source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestRow {
    pub kind: String,
    pub name: String,
    pub url: String,
    pub path: String,
    pub exists: bool,
    pub bytes: Option<u64>,
    pub error: String,
}

impl ManifestRow {
    pub fn from_item(item: &DownloadItem, pack_dir: &Utf8Path) -> Self {
        let size = fs::metadata(item.out_path.as_std_path())
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());
        let path = item
            .out_path
            .strip_prefix(pack_dir)
            .unwrap_or(&item.out_path)
            .to_string();
        Self {
            kind: item.kind.as_str().to_string(),
            name: item.name.clone(),
            url: item.url.clone(),
            path,
            exists: size.is_some(),
            bytes: size,
            error: item.last_error.clone().unwrap_or_default(),
        }
    }
}

pub fn rows_for(items: &[DownloadItem], pack_dir: &Utf8Path) -> Vec<ManifestRow> {
    items
        .iter()
        .map(|item| ManifestRow::from_item(item, pack_dir))
        .collect()
}

/// Rewrite the full manifest, one row per planned item, atomically. Called
/// after planning and again after the download phase so an interrupted run
/// still leaves a usable inventory.
pub fn write_manifest(pack_dir: &Utf8Path, items: &[DownloadItem]) -> Result<(), PackError> {
    let mut content = String::from("kind,name,url,path,exists,bytes,error\n");
    for row in rows_for(items, pack_dir) {
        let bytes = row.bytes.map(|n| n.to_string()).unwrap_or_default();
        content.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_field(&row.kind),
            csv_field(&row.name),
            csv_field(&row.url),
            csv_field(&row.path),
            row.exists,
            bytes,
            csv_field(&row.error),
        ));
    }
    write_atomic(pack_dir, MANIFEST_FILE, content.as_bytes())
        .map_err(|err| PackError::ManifestWrite(err))
}

/// Short human-readable companion to the manifest: which server was queried,
/// with which patterns, and what landed where.
pub fn write_readme(
    pack_dir: &Utf8Path,
    patterns: &[String],
    include_rasters: bool,
    base_url: &str,
) -> Result<(), PackError> {
    let pack_name = pack_dir.file_name().unwrap_or("pack");
    let mut lines = vec![
        format!("# Offline field pack — {pack_name}"),
        String::new(),
        "Layers downloaded from an OWS geospatial server, matching patterns:".to_string(),
    ];
    lines.extend(patterns.iter().map(|p| format!("- `{p}`")));
    lines.extend([
        String::new(),
        "## Contents".to_string(),
        format!("- `{VECTORS_GEOJSON_DIR}/` — vectors as GeoJSON"),
        format!("- `{VECTORS_KML_DIR}/` — vectors as KML (offline desktop-globe viewers)"),
        format!("- `{RASTERS_GEOTIFF_DIR}/` — rasters as GeoTIFF"),
        format!("- `{MANIFEST_FILE}` — inventory of every planned item"),
        String::new(),
        "## Notes".to_string(),
        format!("- Source server: `{base_url}`"),
        format!("- Rasters included: `{include_rasters}`"),
        format!("- Generated: {}", chrono::Utc::now().to_rfc3339()),
        String::new(),
    ]);
    write_atomic(pack_dir, README_FILE, lines.join("\n").as_bytes())
        .map_err(|err| PackError::Filesystem(err))
}

fn write_atomic(dir: &Utf8Path, file_name: &str, content: &[u8]) -> Result<(), String> {
    fs::create_dir_all(dir.as_std_path()).map_err(|err| err.to_string())?;
    let mut temp = tempfile::Builder::new()
        .prefix(file_name)
        .tempfile_in(dir.as_std_path())
        .map_err(|err| err.to_string())?;
    temp.write_all(content).map_err(|err| err.to_string())?;
    let target = dir.join(file_name);
    // Rename straight over any previous snapshot so a readable file is
    // present at all times. Platforms where the rename cannot replace an
    // existing file get one remove-then-retry.
    if let Err(err) = temp.persist(target.as_std_path()) {
        let temp = err.file;
        let _ = fs::remove_file(target.as_std_path());
        temp.persist(target.as_std_path())
            .map_err(|err| err.to_string())?;
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use crate::plan::ItemKind;

    use super::*;

    fn item(pack_dir: &Utf8Path, name: &str, error: Option<&str>) -> DownloadItem {
        DownloadItem {
            kind: ItemKind::VectorGeojson,
            name: name.to_string(),
            url: format!("https://example-geoserver/ows?typeName={name}"),
            out_path: pack_dir.join("vectors_geojson").join(format!("{name}.geojson")),
            last_error: error.map(|e| e.to_string()),
        }
    }

    #[test]
    fn rows_reflect_disk_state() {
        let temp = tempfile::tempdir().unwrap();
        let pack_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let present = item(&pack_dir, "ns_present", None);
        let missing = item(&pack_dir, "ns_missing", Some("permanent after 1 attempt(s): HTTP 404"));

        fs::create_dir_all(present.out_path.parent().unwrap().as_std_path()).unwrap();
        fs::write(present.out_path.as_std_path(), b"payload").unwrap();

        let rows = rows_for(&[present, missing], &pack_dir);
        assert!(rows[0].exists);
        assert_eq!(rows[0].bytes, Some(7));
        assert_eq!(rows[0].error, "");
        assert_eq!(rows[0].path, "vectors_geojson/ns_present.geojson");
        assert!(!rows[1].exists);
        assert_eq!(rows[1].bytes, None);
        assert!(rows[1].error.contains("HTTP 404"));
    }

    #[test]
    fn manifest_is_rewritten_wholesale() {
        let temp = tempfile::tempdir().unwrap();
        let pack_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

        let two = vec![item(&pack_dir, "ns_a", None), item(&pack_dir, "ns_b", None)];
        write_manifest(&pack_dir, &two).unwrap();
        let one = vec![item(&pack_dir, "ns_a", None)];
        write_manifest(&pack_dir, &one).unwrap();

        let content = fs::read_to_string(pack_dir.join(MANIFEST_FILE).as_std_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("kind,name,url,path,exists,bytes,error"));
        assert!(!content.contains("ns_b"));
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn readme_names_patterns_and_server() {
        let temp = tempfile::tempdir().unwrap();
        let pack_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        write_readme(
            &pack_dir,
            &["dakshina_kannada_".to_string()],
            false,
            "https://example-geoserver/geoserver",
        )
        .unwrap();
        let content = fs::read_to_string(pack_dir.join(README_FILE).as_std_path()).unwrap();
        assert!(content.contains("`dakshina_kannada_`"));
        assert!(content.contains("https://example-geoserver/geoserver"));
        assert!(content.contains("Rasters included: `false`"));
    }
}
