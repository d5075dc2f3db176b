//! Agent-wide defaults and well-known object keys.

use std::time::Duration;

/// Key of the user configuration document at the bucket root.
pub const CONFIG_KEY: &str = "config.yaml";

/// Key of the applied-version state document at the bucket root.
pub const STATE_KEY: &str = "state.yaml";

/// Key of the run-lock object guarding against two concurrent agents.
pub const STATE_LOCK_KEY: &str = "state.yaml.lock";

/// Bucket prefix under which per-step artifact sets are written.
pub const STEPS_PREFIX: &str = "steps";

/// Profiles shipped inside a module source repository.
pub const PROFILES_DIR: &str = "profiles";

/// Parameter-store path segment for the custom side channel.
pub const CUSTOM_PARAMETERS_SEGMENT: &str = "custom";

/// Maximum length of the user-chosen resource prefix.
pub const MAX_PREFIX_LENGTH: usize = 10;

/// Cadence at which pipeline state is polled.
pub const PIPELINE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on a single pipeline wait; mirrors the remote job timeout.
pub const PIPELINE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a specific log query is retried before giving up.
pub const LOG_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Transient SDK failures are retried at most this many times.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// First retry delay; doubled on each attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Retry delays never grow beyond this.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(16);

/// Container image the remote jobs run.
pub const AGENT_IMAGE: &str = "ghcr.io/microscaler/infra-agent";

/// Image tag used when the config does not pin `agent_version`.
pub const DEFAULT_AGENT_VERSION: &str = "latest";

/// Environment variable the job container reads to pick its command.
pub const JOB_COMMAND_ENV: &str = "INFRA_AGENT_COMMAND";

/// Environment variable carrying the resource prefix into cloud jobs.
pub const PREFIX_ENV: &str = "INFRA_AGENT_PREFIX";

/// Environment variable overriding the local backend's data directory.
pub const LOCAL_ROOT_ENV: &str = "INFRA_AGENT_HOME";

/// Environment sentinels marking "running inside our own cloud job".
pub const AWS_JOB_SENTINEL: &str = "CODEBUILD_BUILD_ID";
pub const GCP_JOB_SENTINEL: &str = "CLOUD_RUN_JOB";
pub const AZURE_JOB_SENTINEL: &str = "CONTAINER_APP_JOB_NAME";
