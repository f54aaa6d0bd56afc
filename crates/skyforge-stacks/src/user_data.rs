//! Boot script for the vLLM instances.
//!
//! The script drives an instance from `Pending` to `Serving`; the platform
//! handles `Unhealthy` and replacement through target group health checks.
//! The model-repository token is never written into the script or the unit:
//! a helper fetches it from Secrets Manager into a root-only file under
//! `/run` each time the unit starts.

use std::fmt::Write;

use skyforge_common::{AppConfig, SecretRef};

const VLLM_BIN: &str = "/opt/conda/bin/vllm";
const TOKEN_HELPER: &str = "/usr/local/bin/skyforge-fetch-token";
const TOKEN_ENV_FILE: &str = "/run/vllm/hf.env";
const PHASE_FILE: &str = "/var/lib/skyforge/phase";

/// Instance lifecycle as reported by the boot script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Pending,
    DownloadingModel,
    LoadingModel,
    Serving,
    Unhealthy,
    Terminated,
}

impl BootPhase {
    pub fn marker(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::DownloadingModel => "downloading-model",
            Self::LoadingModel => "loading-model",
            Self::Serving => "serving",
            Self::Unhealthy => "unhealthy",
            Self::Terminated => "terminated",
        }
    }

    /// Phases the boot script itself writes, in order.
    pub fn scripted() -> [BootPhase; 3] {
        [Self::DownloadingModel, Self::LoadingModel, Self::Serving]
    }
}

#[derive(Debug, Clone)]
pub struct BootScript {
    pub model: String,
    pub port: u16,
    pub gpu_memory_utilization: f32,
    pub max_model_len: Option<u32>,
    pub tensor_parallel_size: Option<u32>,
    pub vllm_version: Option<String>,
    pub token: SecretRef,
    pub region: String,
    pub user: String,
}

impl BootScript {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let inf = &cfg.service.inference;
        Self {
            model: inf.model.clone(),
            port: cfg.network.ports.inference,
            gpu_memory_utilization: inf.gpu_memory_utilization,
            max_model_len: inf.max_model_len,
            tensor_parallel_size: inf.tensor_parallel_size,
            vllm_version: inf.vllm_version.clone(),
            token: cfg.model_token.clone(),
            region: cfg.env.region.clone(),
            user: inf.service_user.clone(),
        }
    }

    /// `vllm serve` command line of the systemd unit.
    pub fn serve_command(&self) -> String {
        let mut cmd = format!(
            "{VLLM_BIN} serve {} --host 0.0.0.0 --port {} --gpu-memory-utilization {}",
            self.model, self.port, self.gpu_memory_utilization
        );
        if let Some(v) = self.max_model_len {
            let _ = write!(cmd, " --max-model-len {v}");
        }
        if let Some(v) = self.tensor_parallel_size {
            let _ = write!(cmd, " --tensor-parallel-size {v}");
        }
        cmd
    }

    fn pip_spec(&self) -> String {
        match self.vllm_version.as_deref() {
            Some(v) => format!("vllm=={v}"),
            None => "vllm".to_string(),
        }
    }

    pub fn render(&self) -> String {
        let [downloading, loading, serving] = BootPhase::scripted().map(BootPhase::marker);
        format!(
            r#"#!/bin/bash
set -euo pipefail
export PATH=/opt/conda/bin:$PATH

mkdir -p "$(dirname {PHASE_FILE})"
phase() {{
  echo "$1" > {PHASE_FILE}
  logger -t skyforge-boot "phase=$1"
}}

phase {downloading}
python -m pip install --upgrade pip
pip install {pip}

cat << 'EOF' > {TOKEN_HELPER}
#!/bin/bash
set -euo pipefail
install -d -m 0700 "$(dirname {TOKEN_ENV_FILE})"
TOKEN=$(aws secretsmanager get-secret-value --secret-id {secret_id} --query SecretString --output text --region {region})
umask 077
printf 'HF_TOKEN=%s\n' "$TOKEN" > {TOKEN_ENV_FILE}
EOF
chmod 0755 {TOKEN_HELPER}

phase {loading}
cat << 'EOF' > /etc/systemd/system/vllm.service
[Unit]
Description=vLLM inference server
After=network-online.target
Wants=network-online.target

[Service]
ExecStartPre=+{TOKEN_HELPER}
EnvironmentFile=-{TOKEN_ENV_FILE}
Environment=PATH=/opt/conda/bin:/usr/local/bin:/usr/bin:/bin
ExecStart={serve}
Restart=always
RestartSec=10
User={user}
WorkingDirectory=/home/{user}

[Install]
WantedBy=multi-user.target
EOF

systemctl daemon-reload
systemctl enable --now vllm

(
  until curl -sf http://localhost:{port}/v1/models > /dev/null; do
    sleep 30
  done
  phase {serving}
) &
"#,
            pip = self.pip_spec(),
            secret_id = self.token.secret_id(),
            region = self.region,
            serve = self.serve_command(),
            user = self.user,
            port = self.port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> BootScript {
        BootScript::from_config(&AppConfig::default())
    }

    #[test]
    fn test_serve_command() {
        let mut s = script();
        assert_eq!(
            s.serve_command(),
            "/opt/conda/bin/vllm serve google/medgemma-4b-it --host 0.0.0.0 --port 8000 --gpu-memory-utilization 0.9"
        );
        s.max_model_len = Some(8192);
        s.tensor_parallel_size = Some(2);
        assert!(s.serve_command().ends_with("--max-model-len 8192 --tensor-parallel-size 2"));
    }

    #[test]
    fn test_token_fetched_at_boot_only() {
        let rendered = script().render();
        assert!(rendered.contains("--secret-id HuggingFaceToken"));
        assert!(rendered.contains("--region us-east-1"));
        assert!(rendered.contains("ExecStartPre=+/usr/local/bin/skyforge-fetch-token"));
        // Optional so the first start can reach the helper that creates it.
        assert!(rendered.contains("EnvironmentFile=-/run/vllm/hf.env"));
        assert!(!rendered.contains("EnvironmentFile=/run"));
        // Nothing expands the token into the unit itself.
        assert!(!rendered.contains("Environment=HF_TOKEN"));
    }

    #[test]
    fn test_phases_in_order() {
        let rendered = script().render();
        let pos = |m: &str| rendered.find(&format!("phase {m}")).unwrap();
        assert!(pos("downloading-model") < pos("loading-model"));
        assert!(pos("loading-model") < pos("serving"));
        assert!(rendered.contains("Restart=always"));
    }

    #[test]
    fn test_pinned_version() {
        let mut s = script();
        s.vllm_version = Some("0.8.3".into());
        assert!(s.render().contains("pip install vllm==0.8.3"));
    }
}
