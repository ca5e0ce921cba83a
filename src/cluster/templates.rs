//! Tekton pipeline descriptors.
//!
//! Produces the `Pipeline` and `PipelineRun` objects for a function:
//! an optional `fetch-sources` git task, a `build` task (pack or s2i),
//! and a `deploy` task, wired through the function's PVC and registry
//! secret.

use kube::api::DynamicObject;
use serde_json::json;

use crate::builders;
use crate::config::interpolate::interpolate_envs;
use crate::config::model::{Function, BUILDER_HOST, BUILDER_PACK, BUILDER_S2I};
use crate::cluster::resources;

/// Step images for the cluster-side tasks.
pub const GIT_INIT_IMAGE: &str = "cgr.dev/chainguard/git:latest";
pub const S2I_GENERATE_IMAGE: &str = "quay.io/openshift-pipeline/s2i:nightly";
pub const BUILDAH_IMAGE: &str = "quay.io/buildah/stable:v1.35";
pub const DEPLOYER_IMAGE: &str = "ghcr.io/fnforge/deployer:latest";

pub const DEFAULT_S2I_SCRIPTS_URL: &str = "image:///usr/libexec/s2i";
const QUARKUS_S2I_SCRIPTS_URL: &str = "image:///usr/local/s2i";

/// Default s2i builder images per runtime.
pub const DEFAULT_S2I_IMAGES: &[(&str, &str)] = &[
    ("node", "registry.access.redhat.com/ubi8/nodejs-20-minimal"),
    ("nodejs", "registry.access.redhat.com/ubi8/nodejs-20-minimal"),
    ("typescript", "registry.access.redhat.com/ubi8/nodejs-20-minimal"),
    ("python", "registry.access.redhat.com/ubi8/python-312"),
    ("quarkus", "registry.access.redhat.com/ubi8/openjdk-21"),
    ("go", "registry.access.redhat.com/ubi8/go-toolset"),
];

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("runtime required for pack builds")]
    RuntimeRequired,
    #[error("buildpacks are not supported for on-cluster builds")]
    BuildpacksUnsupported,
    #[error("the 'host' builder cannot be used for cluster deployment")]
    HostBuilderUnsupported,
    #[error("no s2i builder image for runtime '{0}'")]
    NoS2iImage(String),
    #[error("unknown builder '{0}'")]
    UnknownBuilder(String),
    #[error(transparent)]
    Builder(#[from] crate::builders::BuilderError),
    #[error("building pipeline envs: {0}")]
    Env(#[from] crate::config::interpolate::TemplateError),
    #[error("encoding pipeline: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Validate a function for the cluster pathway.
pub fn validate(f: &Function) -> Result<(), TemplateError> {
    match f.build.builder.as_str() {
        BUILDER_PACK => {
            if f.runtime.is_empty() {
                return Err(TemplateError::RuntimeRequired);
            }
            if !f.build.buildpacks.is_empty() {
                return Err(TemplateError::BuildpacksUnsupported);
            }
            Ok(())
        }
        BUILDER_S2I => {
            s2i_builder_image(f)?;
            Ok(())
        }
        BUILDER_HOST => Err(TemplateError::HostBuilderUnsupported),
        other => Err(TemplateError::UnknownBuilder(other.to_string())),
    }
}

/// The s2i builder image for a function: override else runtime default.
pub fn s2i_builder_image(f: &Function) -> Result<String, TemplateError> {
    if let Some(img) = f.build.builder_images.get(BUILDER_S2I) {
        if !img.is_empty() {
            return Ok(img.clone());
        }
    }
    DEFAULT_S2I_IMAGES
        .iter()
        .find(|(rt, _)| *rt == f.runtime)
        .map(|(_, img)| img.to_string())
        .ok_or_else(|| TemplateError::NoS2iImage(f.runtime.clone()))
}

/// The s2i assemble/run scripts location inside the builder image.
pub fn s2i_scripts_url(runtime: &str) -> &'static str {
    if runtime == "quarkus" {
        QUARKUS_S2I_SCRIPTS_URL
    } else {
        DEFAULT_S2I_SCRIPTS_URL
    }
}

/// The build context directory. S2I defaults to `.` when unset.
fn context_dir(f: &Function) -> String {
    if !f.build.git.context_dir.is_empty() {
        return f.build.git.context_dir.clone();
    }
    if f.build.builder == BUILDER_S2I {
        return ".".to_string();
    }
    String::new()
}

/// Build the function's `Pipeline` descriptor.
pub fn pipeline(f: &Function) -> Result<DynamicObject, TemplateError> {
    validate(f)?;
    let name = resources::pipeline_name(f);
    let with_git = !f.build.git.url.is_empty();

    let mut tasks = Vec::new();
    if with_git {
        tasks.push(fetch_sources_task());
    }
    tasks.push(build_task(f, with_git)?);
    tasks.push(deploy_task());

    let mut params = vec![
        json!({"name": "APP_IMAGE", "type": "string", "description": "image reference to build"}),
        json!({"name": "REGISTRY", "type": "string", "description": "registry the image is pushed to"}),
        json!({"name": "SOURCE_SUBPATH", "type": "string", "default": "", "description": "path of the function within the sources"}),
        json!({"name": "BUILDER_IMAGE", "type": "string", "description": "builder image to run"}),
        json!({"name": "ENV_VARS", "type": "array", "default": [], "description": "build-time environment"}),
    ];
    if with_git {
        params.push(json!({"name": "url", "type": "string"}));
        params.push(json!({"name": "revision", "type": "string", "default": ""}));
    }
    if f.build.builder == BUILDER_S2I {
        params.push(json!({
            "name": "S2I_IMAGE_SCRIPTS_URL",
            "type": "string",
            "default": s2i_scripts_url(&f.runtime),
        }));
    }

    let object = json!({
        "apiVersion": "tekton.dev/v1",
        "kind": "Pipeline",
        "metadata": {
            "name": name,
            "labels": resources::function_labels(f),
        },
        "spec": {
            "params": params,
            "workspaces": [
                {"name": "source-workspace", "description": "function sources"},
                {"name": "cache-workspace", "description": "build cache"},
                {"name": "dockerconfig-workspace", "description": "registry credentials", "optional": true},
            ],
            "tasks": tasks,
        }
    });
    Ok(serde_json::from_value(object)?)
}

fn fetch_sources_task() -> serde_json::Value {
    json!({
        "name": "fetch-sources",
        "params": [
            {"name": "url", "value": "$(params.url)"},
            {"name": "revision", "value": "$(params.revision)"},
        ],
        "workspaces": [{"name": "output", "workspace": "source-workspace"}],
        "taskSpec": {
            "params": [
                {"name": "url", "type": "string"},
                {"name": "revision", "type": "string", "default": ""},
            ],
            "workspaces": [{"name": "output"}],
            "steps": [{
                "name": "clone",
                "image": GIT_INIT_IMAGE,
                "workingDir": "$(workspaces.output.path)",
                "script": concat!(
                    "#!/bin/sh\nset -e\n",
                    "rm -rf ./* ./.[!.]* 2>/dev/null || true\n",
                    "git clone \"$(params.url)\" .\n",
                    "if [ -n \"$(params.revision)\" ]; then git checkout \"$(params.revision)\"; fi\n",
                ),
            }],
        }
    })
}

fn build_task(f: &Function, with_git: bool) -> Result<serde_json::Value, TemplateError> {
    let step = if f.build.builder == BUILDER_S2I {
        s2i_steps()
    } else {
        pack_steps()
    };
    let mut task_params = vec![
        json!({"name": "APP_IMAGE", "type": "string"}),
        json!({"name": "REGISTRY", "type": "string"}),
        json!({"name": "SOURCE_SUBPATH", "type": "string", "default": ""}),
        json!({"name": "BUILDER_IMAGE", "type": "string"}),
        json!({"name": "ENV_VARS", "type": "array", "default": []}),
    ];
    let mut call_params = vec![
        json!({"name": "APP_IMAGE", "value": "$(params.APP_IMAGE)"}),
        json!({"name": "REGISTRY", "value": "$(params.REGISTRY)"}),
        json!({"name": "SOURCE_SUBPATH", "value": "$(params.SOURCE_SUBPATH)"}),
        json!({"name": "BUILDER_IMAGE", "value": "$(params.BUILDER_IMAGE)"}),
        json!({"name": "ENV_VARS", "value": ["$(params.ENV_VARS[*])"]}),
    ];
    if f.build.builder == BUILDER_S2I {
        task_params.push(json!({
            "name": "S2I_IMAGE_SCRIPTS_URL",
            "type": "string",
            "default": DEFAULT_S2I_SCRIPTS_URL,
        }));
        call_params.push(json!({
            "name": "S2I_IMAGE_SCRIPTS_URL",
            "value": "$(params.S2I_IMAGE_SCRIPTS_URL)",
        }));
    }

    let mut task = json!({
        "name": "build",
        "params": call_params,
        "workspaces": [
            {"name": "source", "workspace": "source-workspace"},
            {"name": "cache", "workspace": "cache-workspace"},
            {"name": "dockerconfig", "workspace": "dockerconfig-workspace"},
        ],
        "taskSpec": {
            "params": task_params,
            "results": [{"name": "IMAGE_DIGEST", "description": "digest of the built image"}],
            "workspaces": [
                {"name": "source"},
                {"name": "cache"},
                {"name": "dockerconfig", "optional": true},
            ],
            "steps": step,
        }
    });
    if with_git {
        task["runAfter"] = json!(["fetch-sources"]);
    }
    Ok(task)
}

fn pack_steps() -> serde_json::Value {
    json!([{
        "name": "build",
        "image": "$(params.BUILDER_IMAGE)",
        "env": [
            {"name": "CNB_PLATFORM_API", "value": "0.12"},
            {"name": "DOCKER_CONFIG", "value": "$(workspaces.dockerconfig.path)"},
        ],
        "args": ["$(params.ENV_VARS[*])"],
        "script": concat!(
            "#!/usr/bin/env bash\nset -e\n",
            "mkdir -p /platform/env\n",
            "for v in \"$@\"; do printf '%s' \"${v#*=}\" > \"/platform/env/${v%%=*}\"; done\n",
            "/cnb/lifecycle/creator \\\n",
            "  -app=\"$(workspaces.source.path)/$(params.SOURCE_SUBPATH)\" \\\n",
            "  -cache-dir=\"$(workspaces.cache.path)\" \\\n",
            "  -layers=/layers \\\n",
            "  -platform=/platform \\\n",
            "  \"$(params.APP_IMAGE)\"\n",
            "grep -m1 digest /layers/report.toml | cut -d'\"' -f2 | tr -d '\\n' > \"$(results.IMAGE_DIGEST.path)\"\n",
        ),
    }])
}

fn s2i_steps() -> serde_json::Value {
    json!([
        {
            "name": "generate",
            "image": S2I_GENERATE_IMAGE,
            "workingDir": "$(workspaces.source.path)",
            "script": concat!(
                "#!/bin/sh\nset -e\n",
                "s2i build \"$(params.SOURCE_SUBPATH)\" \"$(params.BUILDER_IMAGE)\" \\\n",
                "  --image-scripts-url \"$(params.S2I_IMAGE_SCRIPTS_URL)\" \\\n",
                "  --as-dockerfile /gen-source/Dockerfile.gen\n",
            ),
            "volumeMounts": [{"name": "gen-source", "mountPath": "/gen-source"}],
        },
        {
            "name": "build-and-push",
            "image": BUILDAH_IMAGE,
            "workingDir": "/gen-source",
            "env": [{"name": "DOCKER_CONFIG", "value": "$(workspaces.dockerconfig.path)"}],
            "script": concat!(
                "#!/bin/sh\nset -e\n",
                "buildah bud --storage-driver=vfs -f /gen-source/Dockerfile.gen -t \"$(params.APP_IMAGE)\" .\n",
                "buildah push --storage-driver=vfs --digestfile /tmp/image-digest \\\n",
                "  \"$(params.APP_IMAGE)\" \"docker://$(params.APP_IMAGE)\"\n",
                "tr -d '\\n' < /tmp/image-digest > \"$(results.IMAGE_DIGEST.path)\"\n",
            ),
            "volumeMounts": [{"name": "gen-source", "mountPath": "/gen-source"}],
            "securityContext": {"capabilities": {"add": ["SETFCAP"]}},
        }
    ])
}

fn deploy_task() -> serde_json::Value {
    json!({
        "name": "deploy",
        "runAfter": ["build"],
        "params": [
            {"name": "path", "value": "$(workspaces.source.path)/$(params.SOURCE_SUBPATH)"},
            {"name": "image", "value": "$(params.APP_IMAGE)@$(tasks.build.results.IMAGE_DIGEST)"},
        ],
        "workspaces": [{"name": "source", "workspace": "source-workspace"}],
        "taskSpec": {
            "params": [
                {"name": "path", "type": "string"},
                {"name": "image", "type": "string"},
            ],
            "workspaces": [{"name": "source"}],
            "steps": [{
                "name": "deploy",
                "image": DEPLOYER_IMAGE,
                "args": ["deploy", "--path=$(params.path)", "--image=$(params.image)"],
            }],
        }
    })
}

/// Build the `PipelineRun` descriptor for one invocation.
pub fn pipeline_run(f: &Function, image: &str) -> Result<DynamicObject, TemplateError> {
    validate(f)?;
    let registry = crate::registry::Reference::parse(image)
        .map(|r| r.registry)
        .unwrap_or_default();

    let envs = interpolate_envs(&f.build.build_envs)?;
    let env_values: Vec<String> = envs.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let builder_image = if f.build.builder == BUILDER_S2I {
        s2i_builder_image(f)?
    } else {
        builders::builder_image(f)?
    };

    let mut params = vec![
        json!({"name": "APP_IMAGE", "value": image}),
        json!({"name": "REGISTRY", "value": registry}),
        json!({"name": "SOURCE_SUBPATH", "value": context_dir(f)}),
        json!({"name": "BUILDER_IMAGE", "value": builder_image}),
        json!({"name": "ENV_VARS", "value": env_values}),
    ];
    if !f.build.git.url.is_empty() {
        params.push(json!({"name": "url", "value": f.build.git.url}));
        params.push(json!({"name": "revision", "value": f.build.git.revision}));
    }
    if f.build.builder == BUILDER_S2I {
        params.push(json!({
            "name": "S2I_IMAGE_SCRIPTS_URL",
            "value": s2i_scripts_url(&f.runtime),
        }));
    }

    let mut labels = resources::function_labels(f);
    labels.insert(
        "tekton.dev/pipeline".to_string(),
        resources::pipeline_name(f),
    );

    let object = json!({
        "apiVersion": "tekton.dev/v1",
        "kind": "PipelineRun",
        "metadata": {
            "generateName": resources::pipeline_run_prefix(f),
            "labels": labels,
        },
        "spec": {
            "pipelineRef": {"name": resources::pipeline_name(f)},
            "params": params,
            "taskRunTemplate": {
                "podTemplate": {"securityContext": {"runAsNonRoot": true, "fsGroup": 65532}}
            },
            "workspaces": [
                {
                    "name": "source-workspace",
                    "persistentVolumeClaim": {"claimName": resources::pvc_name(f)},
                    "subPath": "source",
                },
                {
                    "name": "cache-workspace",
                    "persistentVolumeClaim": {"claimName": resources::pvc_name(f)},
                    "subPath": "cache",
                },
                {
                    "name": "dockerconfig-workspace",
                    "secret": {"secretName": resources::secret_name(f)},
                },
            ],
        }
    });
    Ok(serde_json::from_value(object)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_function() -> Function {
        Function {
            name: "greeter".into(),
            runtime: "node".into(),
            ..Default::default()
        }
    }

    #[test]
    fn pack_requires_runtime() {
        let mut f = pack_function();
        f.runtime.clear();
        assert!(matches!(validate(&f), Err(TemplateError::RuntimeRequired)));
    }

    #[test]
    fn pack_rejects_buildpack_overrides() {
        let mut f = pack_function();
        f.build.buildpacks = vec!["example.com/bp".into()];
        assert!(matches!(
            validate(&f),
            Err(TemplateError::BuildpacksUnsupported)
        ));
    }

    #[test]
    fn host_builder_is_rejected() {
        let mut f = pack_function();
        f.build.builder = "host".into();
        assert!(matches!(
            validate(&f),
            Err(TemplateError::HostBuilderUnsupported)
        ));
    }

    #[test]
    fn unknown_builder_is_named() {
        let mut f = pack_function();
        f.build.builder = "kaniko".into();
        let err = validate(&f).unwrap_err();
        assert!(err.to_string().contains("kaniko"), "{err}");
    }

    #[test]
    fn s2i_requires_resolvable_builder_image() {
        let mut f = pack_function();
        f.build.builder = "s2i".into();
        f.runtime = "cobol".into();
        assert!(matches!(validate(&f), Err(TemplateError::NoS2iImage(_))));
        f.runtime = "python".into();
        assert!(validate(&f).is_ok());
    }

    #[test]
    fn quarkus_overrides_s2i_scripts_url() {
        assert_eq!(s2i_scripts_url("quarkus"), "image:///usr/local/s2i");
        assert_eq!(s2i_scripts_url("node"), DEFAULT_S2I_SCRIPTS_URL);
    }

    #[test]
    fn s2i_context_dir_defaults_to_dot() {
        let mut f = pack_function();
        f.build.builder = "s2i".into();
        assert_eq!(context_dir(&f), ".");
        f.build.git.context_dir = "svc/api".into();
        assert_eq!(context_dir(&f), "svc/api");
        // Pack leaves it empty.
        let f = pack_function();
        assert_eq!(context_dir(&f), "");
    }

    #[test]
    fn pipeline_has_git_task_only_with_url() {
        let f = pack_function();
        let p = pipeline(&f).unwrap();
        let tasks = p.data["spec"]["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["name"], "build");
        assert_eq!(tasks[1]["name"], "deploy");

        let mut f = pack_function();
        f.build.git.url = "https://example.com/r.git".into();
        let p = pipeline(&f).unwrap();
        let tasks = p.data["spec"]["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0]["name"], "fetch-sources");
    }

    #[test]
    fn deploy_pins_image_to_build_digest() {
        let f = pack_function();
        let p = pipeline(&f).unwrap();
        let tasks = p.data["spec"]["tasks"].as_array().unwrap();
        let deploy = &tasks[1];
        let image_param = deploy["params"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["name"] == "image")
            .unwrap();
        assert_eq!(
            image_param["value"],
            "$(params.APP_IMAGE)@$(tasks.build.results.IMAGE_DIGEST)"
        );
    }

    #[test]
    fn pipeline_run_carries_interpolated_envs() {
        std::env::set_var("FNFORGE_TEST_TPL", "resolved");
        let mut f = pack_function();
        f.build.build_envs = vec![crate::config::model::EnvVar::new(
            "NAME",
            "{{ env:FNFORGE_TEST_TPL }}",
        )];
        let run = pipeline_run(&f, "ghcr.io/alice/greeter:latest").unwrap();
        let params = run.data["spec"]["params"].as_array().unwrap();
        let envs = params.iter().find(|p| p["name"] == "ENV_VARS").unwrap();
        let values = envs["value"].as_array().unwrap();
        assert_eq!(values[0], "NAME=resolved");
    }

    #[test]
    fn pipeline_run_uses_generate_name_and_workspaces() {
        let f = pack_function();
        let run = pipeline_run(&f, "ghcr.io/alice/greeter:latest").unwrap();
        assert_eq!(
            run.metadata.generate_name.as_deref(),
            Some("greeter-pack-upload-run-")
        );
        let workspaces = run.data["spec"]["workspaces"].as_array().unwrap();
        assert_eq!(workspaces.len(), 3);
        assert_eq!(
            workspaces[0]["persistentVolumeClaim"]["claimName"],
            "greeter-pack-upload"
        );
        assert_eq!(workspaces[0]["subPath"], "source");
        assert_eq!(workspaces[1]["subPath"], "cache");
        assert_eq!(
            workspaces[2]["secret"]["secretName"],
            "greeter-pack-upload"
        );
    }

    #[test]
    fn configured_builder_image_reaches_the_run() {
        let mut f = pack_function();
        f.build
            .builder_images
            .insert("pack".into(), "example.com/b".into());
        let run = pipeline_run(&f, "ghcr.io/alice/greeter:latest").unwrap();
        let params = run.data["spec"]["params"].as_array().unwrap();
        let builder = params.iter().find(|p| p["name"] == "BUILDER_IMAGE").unwrap();
        assert_eq!(builder["value"], "example.com/b");
    }
}
