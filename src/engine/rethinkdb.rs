use super::EngineSpec;
use std::ffi::OsString;
use std::path::Path;

/// rethinkdb's CLI: `create -d <dir>` to initialize, `serve ...` to run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RethinkDbSpec;

impl EngineSpec for RethinkDbSpec {
    fn name(&self) -> &'static str {
        "rethinkdb"
    }

    fn data_dir_name(&self) -> &'static str {
        "rethinkdb_data"
    }

    fn init_args(&self, data_dir: &Path) -> Vec<OsString> {
        vec!["create".into(), "-d".into(), data_dir.into()]
    }

    fn init_ready_sentinel(&self, data_dir: &Path) -> String {
        format!("Created directory '{}'", data_dir.display())
    }

    fn serve_args(&self, data_dir: &Path, driver_port: u16, cluster_port: u16) -> Vec<OsString> {
        vec![
            "serve".into(),
            "--driver-port".into(),
            driver_port.to_string().into(),
            "--cluster-port".into(),
            cluster_port.to_string().into(),
            "--directory".into(),
            data_dir.into(),
            // The admin UI would need a third port
            "--no-http-admin".into(),
        ]
    }

    fn serve_ready_sentinel(&self) -> &'static str {
        "Loading data from directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_invocation() {
        let dir = Path::new("/tmp/work/rethinkdb_data");
        assert_eq!(
            RethinkDbSpec.init_args(dir),
            vec![
                OsString::from("create"),
                OsString::from("-d"),
                OsString::from("/tmp/work/rethinkdb_data")
            ]
        );
        assert_eq!(
            RethinkDbSpec.init_ready_sentinel(dir),
            "Created directory '/tmp/work/rethinkdb_data'"
        );
    }

    #[test]
    fn serve_invocation_disables_http_admin() {
        let args = RethinkDbSpec.serve_args(Path::new("/d"), 28015, 29015);
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "serve",
                "--driver-port",
                "28015",
                "--cluster-port",
                "29015",
                "--directory",
                "/d",
                "--no-http-admin"
            ]
        );
    }
}
