//! Generated credential secrets
//!
//! The content of every generated secret is a pure function of the login, the
//! password and the selected connection variant. Reconcilers recompute it on
//! each pass and overwrite the live secret whenever the two differ.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::GenericConnection;
use crate::resources::common::{owner_reference, standard_labels};

pub const LOGIN_KEY: &str = "LOGIN";
pub const PASSWORD_KEY: &str = "PASSWORD";
pub const DATABASE_KEY: &str = "DATABASE";
pub const HOST_KEY: &str = "HOST";
pub const PORT_KEY: &str = "PORT";
pub const ARGS_KEY: &str = "ARGS";
pub const POSTGRES_URL_KEY: &str = "POSTGRES_URL";
pub const POSTGRES_URL_ARGS_KEY: &str = "POSTGRES_URL_ARGS";

/// Keys of an import secret (PROVIDED user roles)
pub const IMPORT_USERNAME_KEY: &str = "USERNAME";
pub const IMPORT_PASSWORD_KEY: &str = "PASSWORD";

/// Keys of an engine credentials secret
pub const ENGINE_USER_KEY: &str = "user";
pub const ENGINE_PASSWORD_KEY: &str = "password";

/// Join engine arguments with per-privilege extra parameters
pub fn connection_args(base: &str, extra: &BTreeMap<String, String>) -> String {
    let mut args: Vec<String> = base
        .split('&')
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    args.extend(extra.iter().map(|(k, v)| format!("{}={}", k, v)));
    args.join("&")
}

/// Data of a per-database connection secret
pub fn connection_secret_data(
    login: &str,
    password: &str,
    database: &str,
    connection: &GenericConnection,
    extra_args: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let args = connection_args(&connection.uri_args, extra_args);
    let url = format!(
        "postgres://{}:{}@{}:{}/{}",
        login, password, connection.host, connection.port, database
    );
    let url_args = if args.is_empty() {
        url.clone()
    } else {
        format!("{}?{}", url, args)
    };

    BTreeMap::from([
        (LOGIN_KEY.to_string(), login.to_string()),
        (PASSWORD_KEY.to_string(), password.to_string()),
        (DATABASE_KEY.to_string(), database.to_string()),
        (HOST_KEY.to_string(), connection.host.clone()),
        (PORT_KEY.to_string(), connection.port.to_string()),
        (ARGS_KEY.to_string(), args),
        (POSTGRES_URL_KEY.to_string(), url),
        (POSTGRES_URL_ARGS_KEY.to_string(), url_args),
    ])
}

/// Data of the work secret holding the live login of a user role
pub fn work_secret_data(login: &str, password: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LOGIN_KEY.to_string(), login.to_string()),
        (PASSWORD_KEY.to_string(), password.to_string()),
    ])
}

/// Build a generated secret owned by `owner`
pub fn generate_secret<K>(owner: &K, name: &str, data: &BTreeMap<String, String>) -> Secret
where
    K: Resource<DynamicType = ()>,
{
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: owner.namespace(),
            labels: Some(standard_labels(owner)),
            owner_references: Some(vec![owner_reference(owner)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Decoded data of a secret (`data` and `stringData` merged)
pub fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut data: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).to_string()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        data.extend(string_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    data
}

/// Read one key of a secret
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret_data(secret).remove(key)
}

/// Whether every desired key is present in the live secret with the desired value
///
/// Keys added to the secret by someone else are left alone.
pub fn secret_matches(live: Option<&Secret>, desired: &BTreeMap<String, String>) -> bool {
    live.is_some_and(|secret| {
        let data = secret_data(secret);
        desired.iter().all(|(k, v)| data.get(k) == Some(v))
    })
}
