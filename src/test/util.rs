use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Document},
    error::Result,
    Client,
};

/// How many times a fail point trips before it turns itself off.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum FailPointMode {
    AlwaysOn,
    Times(i32),
    Off,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, TypedBuilder, Serialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
pub(crate) struct FailCommandOptions {
    pub(crate) error_code: Option<i32>,
    pub(crate) error_labels: Option<Vec<String>>,
    pub(crate) close_connection: Option<bool>,
    pub(crate) write_concern_error: Option<Document>,
}

/// A `failCommand` fail point, configured on the deployment with `configureFailPoint`.
#[derive(Clone, Debug)]
pub(crate) struct FailPoint {
    command: Document,
}

impl FailPoint {
    pub(crate) fn fail_command(
        commands: &[&str],
        mode: FailPointMode,
        options: impl Into<Option<FailCommandOptions>>,
    ) -> Self {
        let mut data = doc! { "failCommands": commands };
        if let Some(options) = options.into() {
            if let Ok(options) = crate::bson::to_document(&options) {
                data.extend(options);
            }
        }
        let mode = crate::bson::to_bson(&mode).unwrap_or_default();
        Self {
            command: doc! {
                "configureFailPoint": "failCommand",
                "mode": mode,
                "data": data,
            },
        }
    }

    pub(crate) async fn enable(&self, client: &Client) -> Result<()> {
        client
            .database("admin")
            .run_command(self.command.clone(), None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serializes_modes() {
        let fail_point = FailPoint::fail_command(
            &["insert"],
            FailPointMode::Times(2),
            FailCommandOptions::builder().error_code(91).build(),
        );
        assert_eq!(
            fail_point.command,
            doc! {
                "configureFailPoint": "failCommand",
                "mode": { "times": 2 },
                "data": { "failCommands": ["insert"], "errorCode": 91 },
            }
        );
        let off = FailPoint::fail_command(&["insert"], FailPointMode::Off, None);
        assert_eq!(off.command.get_str("mode"), Ok("off"));
    }
}
