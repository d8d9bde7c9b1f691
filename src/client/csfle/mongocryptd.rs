use std::time::Duration;

use tokio::sync::Mutex;

use super::options::{
    AutoEncryptionOptions,
    EO_MONGOCRYPTD_BYPASS_SPAWN,
    EO_MONGOCRYPTD_SPAWN_ARGS,
    EO_MONGOCRYPTD_SPAWN_PATH,
    EO_MONGOCRYPTD_URI,
};
use crate::{
    bson::{doc, Bson, Document},
    crypt::schema::ResolvedSchema,
    error::{Error, ErrorKind, Result},
    options::ClientOptions,
    runtime::process::Process,
    trace::ENCRYPTION_TRACING_EVENT_TARGET,
    Client,
};

const DEFAULT_URI: &str = "mongodb://localhost:27020";
const DEFAULT_PATH: &str = "mongocryptd";
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_SHUTDOWN_ARG: &str = "--idleShutdownTimeoutSecs";

#[derive(Debug)]
struct SpawnOptions {
    path: String,
    args: Vec<String>,
}

/// Query analysis by a `mongocryptd` process, spawned on first use unless spawning is bypassed.
#[derive(Debug)]
pub(crate) struct Mongocryptd {
    client_options: ClientOptions,
    spawn: Option<SpawnOptions>,
    client: Mutex<Option<Client>>,
    process: Mutex<Option<Process>>,
}

impl Mongocryptd {
    pub(super) fn new(opts: &AutoEncryptionOptions) -> Result<Self> {
        let uri = opts
            .extra_option(&EO_MONGOCRYPTD_URI)?
            .unwrap_or(DEFAULT_URI);
        let mut client_options = ClientOptions::parse(uri)?;
        client_options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);

        let spawn = if opts.extra_option(&EO_MONGOCRYPTD_BYPASS_SPAWN)? == Some(true) {
            None
        } else {
            let path = opts
                .extra_option(&EO_MONGOCRYPTD_SPAWN_PATH)?
                .unwrap_or(DEFAULT_PATH)
                .to_string();
            let mut args: Vec<String> = opts
                .extra_option(&EO_MONGOCRYPTD_SPAWN_ARGS)?
                .into_iter()
                .flatten()
                .filter_map(Bson::as_str)
                .map(str::to_string)
                .collect();
            if !args.iter().any(|a| a.starts_with(IDLE_SHUTDOWN_ARG)) {
                args.push(format!("{IDLE_SHUTDOWN_ARG}=60"));
            }
            Some(SpawnOptions { path, args })
        };

        Ok(Self {
            client_options,
            spawn,
            client: Mutex::new(None),
            process: Mutex::new(None),
        })
    }

    async fn spawn(&self) -> Result<()> {
        let Some(ref spawn) = self.spawn else {
            return Ok(());
        };
        let mut process = self.process.lock().await;
        if let Some(ref mut running) = *process {
            if !running.has_exited() {
                return Ok(());
            }
        }
        tracing::debug!(
            target: ENCRYPTION_TRACING_EVENT_TARGET,
            path = %spawn.path,
            args = ?spawn.args,
            "Spawning mongocryptd",
        );
        let spawned = Process::spawn(&spawn.path, &spawn.args).map_err(|e| {
            Error::from(ErrorKind::MongocryptdSpawn {
                path: spawn.path.clone(),
                args: spawn.args.clone(),
                message: e.to_string(),
            })
        })?;
        *process = Some(spawned);
        Ok(())
    }

    async fn client(&self) -> Result<Client> {
        let mut client = self.client.lock().await;
        if let Some(ref c) = *client {
            return Ok(c.clone());
        }
        let c = Client::with_options(self.client_options.clone())?;
        *client = Some(c.clone());
        Ok(c)
    }

    /// Sends `command` together with the schema for analysis and returns the marked command.
    pub(super) async fn mark(
        &self,
        db: &str,
        mut command: Document,
        schema: &ResolvedSchema,
    ) -> Result<Document> {
        match schema {
            ResolvedSchema::JsonSchema(schema) => {
                command.insert("jsonSchema", schema.raw().clone());
                command.insert("isRemoteSchema", schema.is_remote());
            }
            ResolvedSchema::EncryptedFields(_) => {}
            ResolvedSchema::None => {
                command.insert("jsonSchema", Document::new());
                command.insert("isRemoteSchema", false);
            }
        }

        self.spawn().await?;
        let client = self.client().await?;
        let reply = match client.database(db).run_command(command.clone(), None).await {
            Err(e) if e.is_server_selection_error() && self.spawn.is_some() => {
                tracing::debug!(
                    target: ENCRYPTION_TRACING_EVENT_TARGET,
                    error = %e,
                    "mongocryptd unreachable, respawning",
                );
                self.spawn().await?;
                client.database(db).run_command(command, None).await?
            }
            other => other?,
        };

        let mut result = match reply.get("result") {
            Some(Bson::Document(result)) => result.clone(),
            _ => {
                return Err(Error::invalid_response(
                    "mongocryptd reply is missing the marked command",
                ))
            }
        };
        if reply.get_bool("schemaRequiresEncryption") == Ok(false) {
            result.remove("jsonSchema");
        }
        result.remove("isRemoteSchema");
        Ok(result)
    }

    pub(super) async fn shutdown(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(error) = process.kill().await {
                tracing::debug!(
                    target: ENCRYPTION_TRACING_EVENT_TARGET,
                    %error,
                    "Failed to kill mongocryptd",
                );
            }
        }
        if let Some(client) = self.client.lock().await.take() {
            client.shutdown_unencrypted().await;
        }
    }

    #[cfg(test)]
    pub(super) async fn spawned(&self) -> bool {
        self.process.lock().await.is_some()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        client::csfle::options::KmsProviders,
        crypt::kms::KmsProvider,
        Namespace,
    };

    fn options(extra: Document) -> AutoEncryptionOptions {
        let mut opts = AutoEncryptionOptions::new(
            Namespace::new("keyvault", "datakeys"),
            KmsProviders::new([(KmsProvider::local(), doc! {}, None)]).unwrap(),
        );
        opts.extra_options = Some(extra);
        opts
    }

    #[test]
    fn default_spawn_arguments() {
        let mongocryptd = Mongocryptd::new(&options(doc! {})).unwrap();
        let spawn = mongocryptd.spawn.unwrap();
        assert_eq!(spawn.path, "mongocryptd");
        assert_eq!(spawn.args, vec!["--idleShutdownTimeoutSecs=60".to_string()]);
        assert_eq!(
            mongocryptd.client_options.server_selection_timeout,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn explicit_idle_timeout_is_kept() {
        let mongocryptd = Mongocryptd::new(&options(doc! {
            "mongocryptdSpawnPath": "/opt/bin/mongocryptd",
            "mongocryptdSpawnArgs": ["--idleShutdownTimeoutSecs=5", "--port=27021"],
            "mongocryptdURI": "mongodb://localhost:27021",
        }))
        .unwrap();
        let spawn = mongocryptd.spawn.unwrap();
        assert_eq!(spawn.path, "/opt/bin/mongocryptd");
        assert_eq!(spawn.args, vec!["--idleShutdownTimeoutSecs=5", "--port=27021"]);
    }

    #[test]
    fn bypass_spawn() {
        let mongocryptd =
            Mongocryptd::new(&options(doc! { "mongocryptdBypassSpawn": true })).unwrap();
        assert!(mongocryptd.spawn.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_names_the_path() {
        let mongocryptd = Mongocryptd::new(&options(doc! {
            "mongocryptdSpawnPath": "/nonexistent/mongocryptd",
        }))
        .unwrap();
        let error = mongocryptd.spawn().await.unwrap_err();
        match *error.kind {
            ErrorKind::MongocryptdSpawn { ref path, .. } => {
                assert_eq!(path, "/nonexistent/mongocryptd")
            }
            ref other => panic!("unexpected error {other:?}"),
        }
        assert!(!mongocryptd.spawned().await);
    }
}
