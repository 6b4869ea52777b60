use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The kind of application a group hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppType {
    Rack,
    ClassicRails,
    Wsgi,
}

impl AppType {
    /// The name this type goes by in the spawn-server protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Rack => "rack",
            AppType::ClassicRails => "classic-rails",
            AppType::Wsgi => "wsgi",
        }
    }
}

/// How workers for a group are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnMethod {
    /// Through a long-lived preloader that forks prepared workers.
    Smart,
    /// A fresh exec per worker.
    Direct,
}

impl SpawnMethod {
    /// The name this method goes by in the spawn-server protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            SpawnMethod::Smart => "smart",
            SpawnMethod::Direct => "direct",
        }
    }
}

/// Per-request configuration, passed with every `get`.
///
/// An `Options` value owns all of its strings, so storing it past the
/// scope of the caller is always safe.  Methods can be chained in order
/// to configure it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Root directory of the application.
    pub app_root: String,
    pub app_type: AppType,
    /// User to run workers as; empty means the current user.
    pub user: String,
    /// OS group to run workers as; empty means the current group.
    pub group: String,
    /// The application environment, e.g. "production" or "staging".
    pub environment: String,
    /// Lower bound on the number of workers the spawn loop aims for.
    pub min_processes: u32,
    /// Upper bound on workers in the group; 0 means unlimited.
    pub max_processes: u32,
    /// Retire a worker after this many completed requests; 0 disables.
    pub max_requests: u64,
    /// How long a preloader may sit idle before the spawner shuts it down.
    pub max_preloader_idle_time: Duration,
    /// Overrides the directory watched for restart trigger files.
    pub restart_dir: Option<String>,
    pub spawn_method: SpawnMethod,
    /// Concurrent sessions a single worker accepts; 0 means unlimited.
    pub concurrency: u32,
}

impl Options {
    pub fn new<S: Into<String>>(app_root: S) -> Options {
        Options {
            app_root: app_root.into(),
            app_type: AppType::Rack,
            user: String::new(),
            group: String::new(),
            environment: "production".into(),
            min_processes: 1,
            max_processes: 0,
            max_requests: 0,
            max_preloader_idle_time: Duration::from_secs(5 * 60),
            restart_dir: None,
            spawn_method: SpawnMethod::Smart,
            concurrency: 1,
        }
    }

    pub fn app_type(mut self, app_type: AppType) -> Options {
        self.app_type = app_type;
        self
    }

    pub fn user<S: Into<String>>(mut self, user: S) -> Options {
        self.user = user.into();
        self
    }

    pub fn group<S: Into<String>>(mut self, group: S) -> Options {
        self.group = group.into();
        self
    }

    pub fn environment<S: Into<String>>(mut self, environment: S) -> Options {
        self.environment = environment.into();
        self
    }

    pub fn min_processes(mut self, min: u32) -> Options {
        self.min_processes = min;
        self
    }

    pub fn max_processes(mut self, max: u32) -> Options {
        self.max_processes = max;
        self
    }

    pub fn max_requests(mut self, max: u64) -> Options {
        self.max_requests = max;
        self
    }

    pub fn restart_dir<S: Into<String>>(mut self, dir: S) -> Options {
        self.restart_dir = Some(dir.into());
        self
    }

    pub fn spawn_method(mut self, method: SpawnMethod) -> Options {
        self.spawn_method = method;
        self
    }

    pub fn concurrency(mut self, concurrency: u32) -> Options {
        self.concurrency = concurrency;
        self
    }

    /// Path whose appearance triggers a one-shot restart.
    pub fn restart_file_path(&self) -> PathBuf {
        match self.restart_dir {
            Some(ref dir) => PathBuf::from(dir).join("restart.txt"),
            None => PathBuf::from(&self.app_root).join("tmp").join("restart.txt"),
        }
    }

    /// Path whose modification time change triggers a restart on every get.
    pub fn always_restart_file_path(&self) -> PathBuf {
        match self.restart_dir {
            Some(ref dir) => PathBuf::from(dir).join("always_restart.txt"),
            None => PathBuf::from(&self.app_root).join("always_restart.txt"),
        }
    }
}
