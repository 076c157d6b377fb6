use crate::error::{LocalError, LocalResult};
use base64::prelude::*;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use maplit::btreemap;
use rand::distributions::{Alphanumeric, DistString};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

pub type Map = serde_json::Map<String, Value>;

pub const AUTH_SECRET_NAME: &str = "platform-auth-secrets";
pub const REGISTRY_SECRET_NAME: &str = "platform-registry-credentials";

pub const AUTH_EMAIL_KEY: &str = "instance-admin-email";
pub const AUTH_PASSWORD_KEY: &str = "instance-admin-password";
pub const AUTH_CLIENT_ID_KEY: &str = "instance-admin-client-id";
pub const AUTH_CLIENT_SECRET_KEY: &str = "instance-admin-client-secret";
pub const AUTH_JWT_SECRET_KEY: &str = "jwt-signature-secret";

const GENERATED_SECRET_LEN: usize = 32;

const LOW_RESOURCE_JOB_VARS: &[&str] = &[
    "CHECK_JOB_MAIN_CONTAINER_CPU_REQUEST",
    "CHECK_JOB_MAIN_CONTAINER_MEMORY_REQUEST",
    "DISCOVER_JOB_MAIN_CONTAINER_CPU_REQUEST",
    "DISCOVER_JOB_MAIN_CONTAINER_MEMORY_REQUEST",
    "SPEC_JOB_MAIN_CONTAINER_CPU_REQUEST",
    "SPEC_JOB_MAIN_CONTAINER_MEMORY_REQUEST",
];

/// Sets `value` at a dotted `path`, creating (or replacing non-object)
/// intermediate nodes.
pub fn insert_into_map(map: &mut Map, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            map.insert((*last).to_owned(), value);
        }
        [first, rest @ ..] => {
            let node = map
                .entry((*first).to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = node {
                insert_into_map(child, rest, value);
            } else {
                let mut child = Map::new();
                insert_into_map(&mut child, rest, value);
                *node = Value::Object(child);
            }
        }
    }
}

/// Deep merge; `overlay` wins on conflicts, objects are merged key by key
/// and everything else is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Parses `a.b.c=value` pairs. Scalars are typed the way YAML types them,
/// anything else is kept as a string.
pub fn parse_value_pairs(pairs: &[String]) -> LocalResult<Value> {
    let mut values = Map::new();
    for pair in pairs {
        let (path, raw) = pair.split_once('=').ok_or_else(|| {
            LocalError::Config(format!("Chart value {pair:?} is not in KEY=VALUE form"))
        })?;
        let path: Vec<&str> = path.split('.').collect();
        if path.iter().any(|part| part.is_empty()) {
            return Err(LocalError::Config(format!(
                "Chart value {pair:?} has an empty key"
            )));
        }
        let value = match serde_yaml::from_str::<Value>(raw) {
            Ok(value @ (Value::Bool(_) | Value::Number(_))) => value,
            _ => Value::String(raw.to_owned()),
        };
        insert_into_map(&mut values, &path, value);
    }
    Ok(Value::Object(values))
}

pub async fn read_values_file(path: &Path) -> LocalResult<Value> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
        LocalError::Config(format!("Failed reading values file {}: {err}", path.display()))
    })?;
    if contents.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_yaml::from_str::<Value>(&contents) {
        Ok(Value::Null) => Ok(Value::Object(Map::new())),
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(LocalError::Config(format!(
            "Values file {} must contain a mapping",
            path.display()
        ))),
        Err(err) => Err(LocalError::Config(format!(
            "Failed parsing values file {}: {err}",
            path.display()
        ))),
    }
}

/// Layers the three sources, lowest priority first.
pub fn layer_values(pairs: Value, file: Option<Value>, generated: Value) -> Value {
    let mut values = pairs;
    if let Some(file) = file {
        merge(&mut values, file);
    }
    merge(&mut values, generated);
    values
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

#[derive(Serialize)]
struct DockerConfigJson<'a> {
    auths: BTreeMap<&'a str, DockerAuth<'a>>,
}

#[derive(Serialize)]
struct DockerAuth<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    auth: String,
}

impl RegistryCredentials {
    pub fn to_secret(&self) -> LocalResult<Secret> {
        let config = DockerConfigJson {
            auths: btreemap! {
                self.server.as_str() => DockerAuth {
                    username: &self.username,
                    password: &self.password,
                    email: self.email.as_deref(),
                    auth: BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password)),
                },
            },
        };
        let config = serde_json::to_string(&config)
            .map_err(|err| LocalError::Config(format!("Invalid registry credentials: {err}")))?;
        Ok(secret(
            REGISTRY_SECRET_NAME,
            "kubernetes.io/dockerconfigjson",
            btreemap! { ".dockerconfigjson".to_owned() => config },
        ))
    }
}

/// Credentials of the instance admin, kept in [`AUTH_SECRET_NAME`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthCredentials {
    pub email: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
    pub jwt_secret: String,
}

fn random_secret() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), GENERATED_SECRET_LEN)
}

impl AuthCredentials {
    pub fn generate(email: &str) -> Self {
        Self {
            email: email.to_owned(),
            password: random_secret(),
            client_id: Uuid::new_v4().to_string(),
            client_secret: random_secret(),
            jwt_secret: random_secret(),
        }
    }

    /// `None` unless every key is present.
    pub fn from_secret_data(data: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            email: data.get(AUTH_EMAIL_KEY)?.clone(),
            password: data.get(AUTH_PASSWORD_KEY)?.clone(),
            client_id: data.get(AUTH_CLIENT_ID_KEY)?.clone(),
            client_secret: data.get(AUTH_CLIENT_SECRET_KEY)?.clone(),
            jwt_secret: data.get(AUTH_JWT_SECRET_KEY)?.clone(),
        })
    }

    pub fn to_secret(&self) -> Secret {
        secret(
            AUTH_SECRET_NAME,
            "Opaque",
            btreemap! {
                AUTH_EMAIL_KEY.to_owned() => self.email.clone(),
                AUTH_PASSWORD_KEY.to_owned() => self.password.clone(),
                AUTH_CLIENT_ID_KEY.to_owned() => self.client_id.clone(),
                AUTH_CLIENT_SECRET_KEY.to_owned() => self.client_secret.clone(),
                AUTH_JWT_SECRET_KEY.to_owned() => self.jwt_secret.clone(),
            },
        )
    }
}

fn secret(name: &str, type_: &str, string_data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(crate::k8s::MANAGED_LABELS.clone()),
            ..Default::default()
        },
        type_: Some(type_.to_owned()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Loads a secret manifest that is applied as is.
pub async fn read_secret_file(path: &Path) -> LocalResult<Secret> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
        LocalError::Config(format!("Failed reading secret file {}: {err}", path.display()))
    })?;
    let secret: Secret = serde_yaml::from_str(&contents).map_err(|err| {
        LocalError::Config(format!("Failed parsing secret file {}: {err}", path.display()))
    })?;
    if secret.metadata.name.is_none() {
        return Err(LocalError::Config(format!(
            "Secret in {} has no name",
            path.display()
        )));
    }
    Ok(secret)
}

#[derive(Clone, Debug, Default)]
pub struct PlatformValuesOptions {
    pub low_resource_mode: bool,
    pub registry_secret: Option<String>,
}

/// The values the installer always sets on the platform chart.
pub fn platform_values(options: &PlatformValuesOptions) -> Value {
    let mut values = Map::new();
    insert_into_map(
        &mut values,
        &["global", "auth"],
        json!({
            "enabled": true,
            "cookieSecureSetting": false,
            "secretName": AUTH_SECRET_NAME,
            "instanceAdmin": {
                "emailSecretKey": AUTH_EMAIL_KEY,
                "passwordSecretKey": AUTH_PASSWORD_KEY,
                "clientIdSecretKey": AUTH_CLIENT_ID_KEY,
                "clientSecretSecretKey": AUTH_CLIENT_SECRET_KEY,
            },
            "jwtSignatureSecretKey": AUTH_JWT_SECRET_KEY,
        }),
    );

    if options.low_resource_mode {
        insert_into_map(
            &mut values,
            &["global", "jobs", "resources"],
            json!({"requests": {"cpu": "0", "memory": "0"}}),
        );
        for var in LOW_RESOURCE_JOB_VARS {
            insert_into_map(
                &mut values,
                &["workload-launcher", "env_vars", *var],
                json!("0"),
            );
        }
    }

    if let Some(secret) = &options.registry_secret {
        insert_into_map(
            &mut values,
            &["global", "imagePullSecrets"],
            json!([{ "name": secret }]),
        );
    }

    Value::Object(values)
}

/// Runs the controller on the node's host port so the kind port mapping
/// reaches it.
pub fn ingress_values() -> Value {
    json!({
        "controller": {
            "hostPort": {"enabled": true},
            "service": {"type": "NodePort"},
            "nodeSelector": {"ingress-ready": "true"},
            "tolerations": [{
                "key": "node-role.kubernetes.io/control-plane",
                "operator": "Equal",
                "effect": "NoSchedule",
            }],
            "updateStrategy": {"type": "Recreate"},
        }
    })
}
