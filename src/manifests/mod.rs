//! Typed objects created by a conformance run
//!
//! All builders are pure: they only assemble k8s-openapi structs from a
//! [`RunConfig`]. Creation order and conflict handling live in the runner.

pub mod rbac;

use crate::config::RunConfig;
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar,
    Namespace, Pod, PodSpec, SeccompProfile, SecurityContext, Toleration, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use rbac::{RBACBuilder, RBACBundle};
use std::collections::BTreeMap;

/// Name of the workload pod
pub const POD_NAME: &str = "e2e-conformance-test";

/// Container running the e2e suite
pub const CONFORMANCE_CONTAINER: &str = "conformance-container";

/// Container holding the results volume open after the suite exits
pub const OUTPUT_CONTAINER: &str = "output-container";

pub const SERVICE_ACCOUNT_NAME: &str = "conformance-serviceaccount";
pub const CLUSTER_ROLE_NAME: &str = "conformance-serviceaccount";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "conformance-serviceaccount-role";

/// Directory in both containers where the suite writes its results
pub const RESULTS_DIR: &str = "/tmp/results";

/// Free-form suite log inside [`RESULTS_DIR`]
pub const E2E_LOG_FILE: &str = "e2e.log";

/// JUnit report inside [`RESULTS_DIR`]
pub const JUNIT_FILE: &str = "junit_01.xml";

pub const REPO_LIST_CONFIG_MAP: &str = "repo-list-config";
pub const REPO_LIST_KEY: &str = "repo-list.yaml";
const REPO_LIST_MOUNT: &str = "/tmp/repo-list";

const OUTPUT_VOLUME: &str = "output-volume";
const REPO_LIST_VOLUME: &str = "repo-list-volume";
const NOBODY_UID: i64 = 65534;

/// Namespace the list-images pod runs in
pub const LIST_IMAGES_NAMESPACE: &str = "default";

fn component_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("component".to_string(), "conformance".to_string())])
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Path of a result file inside the pod
pub fn result_path(file: &str) -> String {
    format!("{RESULTS_DIR}/{file}")
}

pub fn namespace(config: &RunConfig) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(config.namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// ServiceAccount, ClusterRole and ClusterRoleBinding for the run
pub fn rbac(config: &RunConfig) -> RBACBundle {
    RBACBuilder::service_account(SERVICE_ACCOUNT_NAME, &config.namespace)
        .with_role(CLUSTER_ROLE_NAME)
        .with_binding(CLUSTER_ROLE_BINDING_NAME)
        .label("component", "conformance")
        .can_everything()
        .can_get_urls(&["/metrics", "/logs", "/logs/*"])
        .build()
}

/// ConfigMap carrying the test image registry overrides
pub fn repo_list_config_map(config: &RunConfig, contents: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(REPO_LIST_CONFIG_MAP.to_string()),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(REPO_LIST_KEY.to_string(), contents)])),
        ..Default::default()
    }
}

/// Environment of the conformance container
pub fn conformance_env(config: &RunConfig, with_repo_list: bool) -> Vec<EnvVar> {
    let mut vars = vec![
        env("E2E_FOCUS", config.focus.clone()),
        env("E2E_SKIP", config.skip.clone()),
        env("E2E_PROVIDER", "skeleton"),
        env("E2E_VERBOSITY", config.verbosity.to_string()),
        env("E2E_USE_GO_RUNNER", "true"),
        env("E2E_EXTRA_ARGS", config.extra_args.join(" ")),
        env("E2E_EXTRA_GINKGO_ARGS", config.ginkgo_args().join(" ")),
    ];

    if config.dry_run {
        vars.push(env("E2E_DRYRUN", "true"));
    }
    if with_repo_list {
        vars.push(env(
            "KUBE_TEST_REPO_LIST",
            format!("{REPO_LIST_MOUNT}/{REPO_LIST_KEY}"),
        ));
    }
    if let Some(repo) = &config.test_repo {
        vars.push(env("KUBE_TEST_REPO", repo.clone()));
    }

    vars
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        run_as_non_root: Some(true),
        run_as_user: Some(NOBODY_UID),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn results_mount() -> VolumeMount {
    VolumeMount {
        name: OUTPUT_VOLUME.to_string(),
        mount_path: RESULTS_DIR.to_string(),
        ..Default::default()
    }
}

/// The two-container workload running the suite
pub fn conformance_pod(config: &RunConfig, image: &str, with_repo_list: bool) -> Pod {
    let mut conformance = Container {
        name: CONFORMANCE_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(conformance_env(config, with_repo_list)),
        volume_mounts: Some(vec![results_mount()]),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    };

    let output = Container {
        name: OUTPUT_CONTAINER.to_string(),
        image: Some(config.busybox_image.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep infinity".to_string(),
        ]),
        volume_mounts: Some(vec![results_mount()]),
        security_context: Some(restricted_security_context()),
        ..Default::default()
    };

    let mut volumes = vec![Volume {
        name: OUTPUT_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];

    if with_repo_list {
        volumes.push(Volume {
            name: REPO_LIST_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: REPO_LIST_CONFIG_MAP.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        if let Some(mounts) = conformance.volume_mounts.as_mut() {
            mounts.push(VolumeMount {
                name: REPO_LIST_VOLUME.to_string(),
                mount_path: REPO_LIST_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(POD_NAME.to_string()),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![conformance, output],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            // Empty key with Exists tolerates every taint
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Short-lived pod printing the images the suite would pull
pub fn list_images_pod(image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            generate_name: Some("list-images-".to_string()),
            namespace: Some(LIST_IMAGES_NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                "list-images".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            containers: vec![Container {
                name: CONFORMANCE_CONTAINER.to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "/usr/local/bin/e2e.test".to_string(),
                    "--list-images".to_string(),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}
