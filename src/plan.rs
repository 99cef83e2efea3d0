use std::collections::BTreeSet;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;

use crate::capabilities::{WCS_VERSION, WFS_VERSION};

pub const VECTORS_GEOJSON_DIR: &str = "vectors_geojson";
pub const VECTORS_KML_DIR: &str = "vectors_kml";
pub const RASTERS_GEOTIFF_DIR: &str = "rasters_geotiff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    VectorGeojson,
    VectorKml,
    RasterGeotiff,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::VectorGeojson => "vector_geojson",
            ItemKind::VectorKml => "vector_kml",
            ItemKind::RasterGeotiff => "raster_geotiff",
        }
    }

    pub fn subdir(&self) -> &'static str {
        match self {
            ItemKind::VectorGeojson => VECTORS_GEOJSON_DIR,
            ItemKind::VectorKml => VECTORS_KML_DIR,
            ItemKind::RasterGeotiff => RASTERS_GEOTIFF_DIR,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ItemKind::VectorGeojson => "geojson",
            ItemKind::VectorKml => "kml",
            ItemKind::RasterGeotiff => "tif",
        }
    }

    /// Whether the payload must be binary. A textual response for such an
    /// item is a server-side error page, not data.
    pub fn expects_binary(&self) -> bool {
        matches!(self, ItemKind::RasterGeotiff)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned transfer. Immutable after planning except for `last_error`,
/// which records the outcome of the most recent attempt for the manifest.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub kind: ItemKind,
    pub name: String,
    pub url: String,
    pub out_path: Utf8PathBuf,
    pub last_error: Option<String>,
}

impl DownloadItem {
    fn new(kind: ItemKind, name: &str, url: String, pack_dir: &Utf8Path) -> Self {
        let out_path = pack_dir
            .join(kind.subdir())
            .join(format!("{}.{}", safe_filename(name), kind.extension()));
        Self {
            kind,
            name: name.to_string(),
            url,
            out_path,
            last_error: None,
        }
    }
}

/// Expand discovered identifiers into the ordered work list. Pure: no network
/// or disk I/O. Output order is sorted matched identifiers, vectors first
/// (GeoJSON then KML per type), then sorted matched coverages, so repeated
/// runs against an unchanged catalog produce identical plans and manifests.
pub fn build_plan(
    typenames: &[String],
    coverage_ids: &[String],
    patterns: &[Regex],
    pack_dir: &Utf8Path,
    base_url: &str,
    include_rasters: bool,
) -> Vec<DownloadItem> {
    let base = base_url.trim_end_matches('/');
    let matches_any = |name: &str| patterns.iter().any(|rx| rx.is_match(name));

    let mut items = Vec::new();

    let matched_types: BTreeSet<&str> = typenames
        .iter()
        .map(String::as_str)
        .filter(|name| matches_any(name))
        .collect();
    for typename in matched_types {
        items.push(DownloadItem::new(
            ItemKind::VectorGeojson,
            typename,
            feature_url(base, typename, "application/json"),
            pack_dir,
        ));
        items.push(DownloadItem::new(
            ItemKind::VectorKml,
            typename,
            feature_url(base, typename, "application/vnd.google-earth.kml+xml"),
            pack_dir,
        ));
    }

    if include_rasters {
        let matched_coverages: BTreeSet<&str> = coverage_ids
            .iter()
            .map(String::as_str)
            .filter(|id| matches_any(id))
            .collect();
        for coverage_id in matched_coverages {
            items.push(DownloadItem::new(
                ItemKind::RasterGeotiff,
                coverage_id,
                coverage_url(base, coverage_id),
                pack_dir,
            ));
        }
    }

    items
}

fn feature_url(base: &str, typename: &str, output_format: &str) -> String {
    format!(
        "{base}/ows?service=WFS&version={WFS_VERSION}&request=GetFeature\
         &typeName={typename}&outputFormat={output_format}"
    )
}

fn coverage_url(base: &str, coverage_id: &str) -> String {
    format!(
        "{base}/ows?service=WCS&version={WCS_VERSION}&request=GetCoverage\
         &CoverageId={coverage_id}&format=geotiff\
         &compression=LZW&tiling=true&tileheight=256&tilewidth=256"
    )
}

/// Collapse anything outside `[A-Za-z0-9._-]` into `_` and cap the length so
/// layer names survive as portable filenames.
pub fn safe_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_subst = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            last_was_subst = false;
        } else if !last_was_subst {
            out.push('_');
            last_was_subst = true;
        }
    }
    out.truncate(220);
    out
}
