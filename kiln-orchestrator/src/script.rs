//! Launch script rendering
//!
//! Produces the shell script that starts a service's inference server:
//! - local docker: `docker run -d` publishing the server port on loopback
//! - local apptainer: `apptainer instance run`, port chosen by the script
//! - slurm: an sbatch script running the server under apptainer on the
//!   compute node
//!
//! Scripts that choose their own port write it to
//! `<home_dir>/.kiln/jobs/<job_id>/port`, where the job layer reads it back.

use thiserror::Error;

use kiln_core::domain::profile::{Profile, Provider};
use kiln_core::domain::service::{ImageKind, JobType, Service};
use kiln_core::dto::service::{ContainerOptions, JobOptions};
use kiln_remote::quote;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Service name '{0}' may only contain letters, digits, '-', '_' and '.'")]
    InvalidName(String),

    #[error("Invalid {field} '{value}'")]
    InvalidOption { field: &'static str, value: String },

    #[error("Job type {0} has no launch script")]
    Unsupported(JobType),
}

/// Renders launch scripts for services
pub trait ScriptRenderer: Send + Sync {
    fn render(
        &self,
        service: &Service,
        profile: &Profile,
        job_options: &JobOptions,
        container_options: &ContainerOptions,
    ) -> Result<String, RenderError>;
}

/// Bundled renderer for the supported images
#[derive(Debug, Clone, Default)]
pub struct DefaultRenderer;

/// Shell function printing the first free TCP port from 8000 upward
const FIND_PORT: &str = r#"find_port() {
    for port in $(seq 8000 8999); do
        if ! (echo > /dev/tcp/127.0.0.1/$port) >/dev/null 2>&1; then
            echo $port
            return 0
        fi
    done
    return 1
}"#;

/// Checks that a service name is safe in file names and container names
pub fn validate_name(name: &str) -> Result<(), RenderError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(RenderError::InvalidName(name.to_string()))
    }
}

/// Checks a value written into an `#SBATCH` directive
fn validate_option(field: &'static str, value: &str) -> Result<(), RenderError> {
    let valid = !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | ',' | '+')
        });

    if valid {
        Ok(())
    } else {
        Err(RenderError::InvalidOption {
            field,
            value: value.to_string(),
        })
    }
}

fn validate_job_options(options: &JobOptions) -> Result<(), RenderError> {
    let fields = [
        ("time", &options.time),
        ("partition", &options.partition),
        ("account", &options.account),
    ];
    for (field, value) in fields {
        if let Some(value) = value {
            validate_option(field, value)?;
        }
    }
    Ok(())
}

/// Name given to the local container or instance of a service
pub fn instance_name(service: &Service) -> String {
    let id = service.id.simple().to_string();
    format!("kiln-{}-{}", service.name, &id[..8])
}

fn default_image(image: ImageKind) -> &'static str {
    match image {
        ImageKind::TextGeneration => "ghcr.io/huggingface/text-generation-inference:latest",
        ImageKind::SpeechRecognition => "ghcr.io/speaches-ai/speaches:latest-cuda",
    }
}

/// Arguments and environment telling the server which model and port to use
fn server_config(
    service: &Service,
    options: &ContainerOptions,
    port: Value,
) -> (Vec<Value>, Vec<(String, Value)>) {
    let mut args: Vec<Value> = Vec::new();
    let mut env: Vec<(String, Value)> = Vec::new();

    match service.image {
        ImageKind::TextGeneration => {
            args.push("--model-id".into());
            args.push(service.model.as_str().into());
            if let Some(revision) = &options.revision {
                args.push("--revision".into());
                args.push(revision.as_str().into());
            }
            args.push("--port".into());
            args.push(port);
        }
        ImageKind::SpeechRecognition => {
            env.push(("WHISPER__MODEL".to_string(), service.model.as_str().into()));
            env.push(("UVICORN_PORT".to_string(), port));
        }
    }

    args.extend(options.extra_args.iter().map(|a| Value::from(a.as_str())));

    let mut extra_env: Vec<_> = options.env.iter().collect();
    extra_env.sort();
    env.extend(
        extra_env
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str()))),
    );

    (args, env)
}

/// Port chosen at run time by scripts that pick their own port
const PORT_VAR: &str = "$PORT";

/// A server argument or environment value
#[derive(Debug, Clone)]
enum Value {
    Literal(String),
    Port,
}

impl Value {
    /// Renders the value as one shell word, prefixed by `prefix`
    fn render(&self, prefix: &str) -> String {
        match self {
            Value::Literal(value) => quote(&format!("{}{}", prefix, value)),
            Value::Port => format!("\"{}{}\"", prefix, PORT_VAR),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Literal(value.to_string())
    }
}

impl DefaultRenderer {
    fn render_docker(
        &self,
        service: &Service,
        profile: &Profile,
        job_options: &JobOptions,
        options: &ContainerOptions,
    ) -> String {
        let container_port = service.image.container_port().to_string();
        let (args, env) = server_config(service, options, container_port.as_str().into());
        let image = options
            .image_ref
            .as_deref()
            .unwrap_or(default_image(service.image));

        let mut run = vec![
            "docker run -d".to_string(),
            format!("--name {}", quote(&instance_name(service))),
            format!("-p 127.0.0.1::{}", container_port),
            format!("-v {}:/data", quote(&profile.cache_dir)),
        ];
        if job_options.gres.is_some_and(|gpus| gpus > 0) {
            run.push("--gpus all".to_string());
        }
        for mount in &service.mounts {
            run.push(format!("-v {}:{}", quote(mount), quote(mount)));
        }
        for (key, value) in &env {
            run.push(format!("-e {}", value.render(&format!("{}=", key))));
        }
        run.push(quote(image));
        run.extend(args.iter().map(|a| a.render("")));

        format!(
            "#!/bin/bash\nset -euo pipefail\n\n{}\n",
            run.join(" \\\n    ")
        )
    }

    fn render_apptainer(
        &self,
        service: &Service,
        profile: &Profile,
        job_options: &JobOptions,
        options: &ContainerOptions,
    ) -> String {
        let (args, env) = server_config(service, options, Value::Port);
        let instance = instance_name(service);

        let mut run = vec!["apptainer instance run".to_string()];
        if job_options.gres.is_some_and(|gpus| gpus > 0) {
            run.push("--nv".to_string());
        }
        run.extend(self.apptainer_flags(service, profile, &env));
        run.push(self.apptainer_image(service, options));
        run.push(quote(&instance));
        run.extend(args.iter().map(|a| a.render("")));

        format!(
            "#!/bin/bash\nset -euo pipefail\n\n{find_port}\n\n\
             JOB_DIR={home}/.kiln/jobs/{instance}\n\
             mkdir -p \"$JOB_DIR\"\n\
             PORT=$(find_port)\n\
             echo \"$PORT\" > \"$JOB_DIR/port\"\n\n\
             {run} >/dev/null\n\n\
             echo {instance}\n",
            find_port = FIND_PORT,
            home = quote(profile.home_dir.trim_end_matches('/')),
            instance = quote(&instance),
            run = run.join(" \\\n    "),
        )
    }

    fn render_slurm(
        &self,
        service: &Service,
        profile: &Profile,
        job_options: &JobOptions,
        options: &ContainerOptions,
    ) -> String {
        let home = profile.home_dir.trim_end_matches('/');
        let (args, env) = server_config(service, options, Value::Port);

        let mut directives = vec![
            format!("#SBATCH --job-name={}", service.name),
            format!("#SBATCH --output={}/.kiln/logs/%j.out", home),
            "#SBATCH --nodes=1".to_string(),
        ];
        if let Some(time) = &job_options.time {
            directives.push(format!("#SBATCH --time={}", time));
        }
        if let Some(partition) = &job_options.partition {
            directives.push(format!("#SBATCH --partition={}", partition));
        }
        if let Some(account) = &job_options.account {
            directives.push(format!("#SBATCH --account={}", account));
        }
        if let Some(gpus) = job_options.gres {
            directives.push(format!("#SBATCH --gres=gpu:{}", gpus));
        }
        if let Some(mem) = job_options.mem {
            directives.push(format!("#SBATCH --mem={}G", mem));
        }
        if let Some(tasks) = job_options.ntasks_per_node {
            directives.push(format!("#SBATCH --ntasks-per-node={}", tasks));
        }

        let mut run = vec!["apptainer run".to_string()];
        if job_options.gres.is_some_and(|gpus| gpus > 0) {
            run.push("--nv".to_string());
        }
        run.extend(self.apptainer_flags(service, profile, &env));
        run.push(self.apptainer_image(service, options));
        run.extend(args.iter().map(|a| a.render("")));

        format!(
            "#!/bin/bash\n{directives}\n\nset -euo pipefail\n\n{find_port}\n\n\
             JOB_DIR={home}/.kiln/jobs/$SLURM_JOB_ID\n\
             mkdir -p \"$JOB_DIR\"\n\
             PORT=$(find_port)\n\
             echo \"$PORT\" > \"$JOB_DIR/port\"\n\n\
             {run}\n",
            directives = directives.join("\n"),
            find_port = FIND_PORT,
            home = quote(home),
            run = run.join(" \\\n    "),
        )
    }

    fn apptainer_flags(
        &self,
        service: &Service,
        profile: &Profile,
        env: &[(String, Value)],
    ) -> Vec<String> {
        let mut flags = vec![format!("--bind {}:/data", quote(&profile.cache_dir))];
        for mount in &service.mounts {
            flags.push(format!("--bind {}", quote(mount)));
        }
        for (key, value) in env {
            flags.push(format!("--env {}", value.render(&format!("{}=", key))));
        }
        flags
    }

    fn apptainer_image(&self, service: &Service, options: &ContainerOptions) -> String {
        let image = options
            .image_ref
            .as_deref()
            .unwrap_or(default_image(service.image));

        if image.ends_with(".sif") || image.contains("://") {
            quote(image)
        } else {
            quote(&format!("docker://{}", image))
        }
    }
}

impl ScriptRenderer for DefaultRenderer {
    fn render(
        &self,
        service: &Service,
        profile: &Profile,
        job_options: &JobOptions,
        container_options: &ContainerOptions,
    ) -> Result<String, RenderError> {
        validate_name(&service.name)?;

        match service.job_type {
            JobType::Local => match service.provider.unwrap_or(Provider::Docker) {
                Provider::Docker => {
                    Ok(self.render_docker(service, profile, job_options, container_options))
                }
                Provider::Apptainer => {
                    Ok(self.render_apptainer(service, profile, job_options, container_options))
                }
            },
            JobType::Slurm => {
                validate_job_options(job_options)?;
                Ok(self.render_slurm(service, profile, job_options, container_options))
            }
            JobType::Ec2 => Err(RenderError::Unsupported(JobType::Ec2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{local_profile, local_service, slurm_profile, slurm_service};

    #[test]
    fn test_name_validation() {
        assert!(validate_name("tgi-bloom_1.0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("../x").is_err());
        assert!(validate_name("x;rm").is_err());
    }

    #[test]
    fn test_docker_script() {
        let service = local_service();
        let options = ContainerOptions {
            revision: Some("main".to_string()),
            ..Default::default()
        };
        let script = DefaultRenderer
            .render(&service, &local_profile(), &JobOptions::default(), &options)
            .unwrap();

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("docker run -d"));
        assert!(script.contains("-p 127.0.0.1::80"));
        assert!(script.contains("--model-id bigscience/bloom-560m"));
        assert!(script.contains("--revision main"));
        assert!(script.contains(&instance_name(&service)));
        assert!(!script.contains("--gpus"));
    }

    #[test]
    fn test_apptainer_script_writes_port_marker() {
        let mut service = local_service();
        service.provider = Some(Provider::Apptainer);
        let script = DefaultRenderer
            .render(
                &service,
                &local_profile(),
                &JobOptions::default(),
                &ContainerOptions::default(),
            )
            .unwrap();

        assert!(script.contains("apptainer instance run"));
        assert!(script.contains("echo \"$PORT\" > \"$JOB_DIR/port\""));
        assert!(script.contains("--port \"$PORT\""));
        assert!(script.trim_end().ends_with(&format!("echo {}", instance_name(&service))));
    }

    #[test]
    fn test_slurm_script_directives() {
        let service = slurm_service();
        let job_options = JobOptions {
            time: Some("00:30:00".to_string()),
            partition: Some("gpu".to_string()),
            gres: Some(1),
            mem: Some(32),
            ..Default::default()
        };
        let script = DefaultRenderer
            .render(
                &service,
                &slurm_profile(),
                &job_options,
                &ContainerOptions::default(),
            )
            .unwrap();

        assert!(script.contains("#SBATCH --job-name=tgi-test"));
        assert!(script.contains("#SBATCH --time=00:30:00"));
        assert!(script.contains("#SBATCH --partition=gpu"));
        assert!(script.contains("#SBATCH --gres=gpu:1"));
        assert!(script.contains("#SBATCH --mem=32G"));
        assert!(!script.contains("--account"));
        assert!(script.contains("JOB_DIR=/home/alice/.kiln/jobs/$SLURM_JOB_ID"));
        assert!(script.contains("--nv"));
        assert!(script.contains("docker://ghcr.io/huggingface/text-generation-inference:latest"));
    }

    #[test]
    fn test_speech_recognition_uses_env() {
        let mut service = local_service();
        service.image = ImageKind::SpeechRecognition;
        service.model = "Systran/faster-whisper-small".to_string();
        let script = DefaultRenderer
            .render(
                &service,
                &local_profile(),
                &JobOptions::default(),
                &ContainerOptions::default(),
            )
            .unwrap();

        assert!(script.contains("-p 127.0.0.1::8000"));
        assert!(script.contains("WHISPER__MODEL=Systran/faster-whisper-small"));
    }

    #[test]
    fn test_ec2_is_unsupported() {
        let mut service = local_service();
        service.job_type = JobType::Ec2;
        let result = DefaultRenderer.render(
            &service,
            &local_profile(),
            &JobOptions::default(),
            &ContainerOptions::default(),
        );
        assert!(matches!(result, Err(RenderError::Unsupported(JobType::Ec2))));
    }

    #[test]
    fn test_extra_args_and_env_are_not_expanded() {
        let mut service = local_service();
        service.provider = Some(Provider::Apptainer);
        let options = ContainerOptions {
            extra_args: vec!["$(touch /tmp/pwned)".to_string(), "$HOME".to_string()],
            env: [("TOKEN".to_string(), "$(id)".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let script = DefaultRenderer
            .render(&service, &local_profile(), &JobOptions::default(), &options)
            .unwrap();

        assert!(script.contains("'$(touch /tmp/pwned)'"));
        assert!(script.contains("'$HOME'"));
        assert!(script.contains("--env 'TOKEN=$(id)'"));
        assert!(!script.contains("\"$(touch"));
        assert!(script.contains("--port \"$PORT\""));
    }

    #[test]
    fn test_docker_env_values_are_quoted() {
        let options = ContainerOptions {
            env: [("HF_TOKEN".to_string(), "$(cat ~/.token)".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let script = DefaultRenderer
            .render(&local_service(), &local_profile(), &JobOptions::default(), &options)
            .unwrap();

        assert!(script.contains("-e 'HF_TOKEN=$(cat ~/.token)'"));
    }

    #[test]
    fn test_slurm_options_are_validated() {
        let service = slurm_service();
        for (field, job_options) in [
            (
                "partition",
                JobOptions {
                    partition: Some("gpu\nrm -rf \"$HOME\"".to_string()),
                    ..Default::default()
                },
            ),
            (
                "time",
                JobOptions {
                    time: Some("01:00:00 --wrap=x".to_string()),
                    ..Default::default()
                },
            ),
            (
                "account",
                JobOptions {
                    account: Some(String::new()),
                    ..Default::default()
                },
            ),
        ] {
            let result = DefaultRenderer.render(
                &service,
                &slurm_profile(),
                &job_options,
                &ContainerOptions::default(),
            );
            assert!(
                matches!(&result, Err(RenderError::InvalidOption { field: f, .. }) if *f == field),
                "{} was accepted: {:?}",
                field,
                result
            );
        }

        let accepted = JobOptions {
            time: Some("1-00:00:00".to_string()),
            partition: Some("gpu,debug".to_string()),
            account: Some("lab_ml".to_string()),
            ..Default::default()
        };
        assert!(
            DefaultRenderer
                .render(&service, &slurm_profile(), &accepted, &ContainerOptions::default())
                .is_ok()
        );
    }
}
