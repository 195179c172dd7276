use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolves where result and error files live:
/// `<root>/<datasource>/<yyyymmdd>/<queryId>.{json,err}`.
#[derive(Clone, Debug)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn result_path(&self, datasource: &str, query_id: &str) -> io::Result<PathBuf> {
        self.path(datasource, query_id, "json")
    }

    pub fn error_path(&self, datasource: &str, query_id: &str) -> io::Result<PathBuf> {
        self.path(datasource, query_id, "err")
    }

    fn path(&self, datasource: &str, query_id: &str, extension: &str) -> io::Result<PathBuf> {
        check_segment(datasource)?;
        check_segment(query_id)?;
        let day = query_id.get(..8).unwrap_or(query_id);
        let dir = self.root.join(datasource).join(day);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{query_id}.{extension}")))
    }
}

fn check_segment(segment: &str) -> io::Result<()> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid path segment '{segment}'"),
        )),
    }
}
