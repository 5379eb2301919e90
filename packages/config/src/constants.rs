// ABOUTME: Environment variable name constants and their defaults
// ABOUTME: Centralized definitions of all environment variables read by the Codebox sandbox engine

// Image Configuration
pub const CODEBOX_DEFAULT_IMAGE: &str = "CODEBOX_DEFAULT_IMAGE";
pub const CODEBOX_IMAGE_PYTHON: &str = "CODEBOX_IMAGE_PYTHON";
pub const CODEBOX_IMAGE_GO: &str = "CODEBOX_IMAGE_GO";
pub const CODEBOX_IMAGE_NODEJS: &str = "CODEBOX_IMAGE_NODEJS";
pub const CODEBOX_PULL_TIMEOUT_SECS: &str = "CODEBOX_PULL_TIMEOUT_SECS";

// Sandbox Lifecycle
pub const CODEBOX_WORK_DIR: &str = "CODEBOX_WORK_DIR";
pub const CODEBOX_STOP_TIMEOUT_SECS: &str = "CODEBOX_STOP_TIMEOUT_SECS";
pub const CODEBOX_LABEL_PREFIX: &str = "CODEBOX_LABEL_PREFIX";

// Progress Reporting
pub const CODEBOX_PROGRESS_INTERVAL_MS: &str = "CODEBOX_PROGRESS_INTERVAL_MS";

// Container Engine Connection (read by the Docker client itself)
pub const DOCKER_HOST: &str = "DOCKER_HOST";

// Defaults
pub const DEFAULT_IMAGE: &str = "python:3.12-slim-bookworm";
pub const DEFAULT_WORK_DIR: &str = "/app";
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PULL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LABEL_PREFIX: &str = "codebox.sandbox";
