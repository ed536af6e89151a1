use anyhow::{Context, bail};
use config::Config;
use serde_json::Value;
use std::path::Path;

/// Load an instrument configuration document (YAML/TOML/JSON) into the
/// raw tree the keymaster is seeded with.
///
/// Only the root shape is checked here; section-level validation
/// (`components`, `connections`, `controller`) belongs to the
/// controller, which owns the error taxonomy for it.
pub fn load_tree(path: impl AsRef<Path>) -> anyhow::Result<Value> {
    let path = path.as_ref();

    let document = Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .build()
        .with_context(|| format!("cannot read configuration document {}", path.display()))?;

    let tree: Value = document
        .try_deserialize()
        .with_context(|| format!("{} does not deserialize into a value tree", path.display()))?;

    if !tree.is_object() {
        bail!("{} must hold a map at the document root", path.display());
    }

    Ok(tree)
}
