use rmcp::model::{RawResource, Resource, ResourceContents};

use crate::error::GatewayError;

pub const HELP_URI: &str = "graph://help";

const HELP_TEXT: &str = r#"# Microsoft Graph MCP gateway

One tool, `graph_command`, forwards a command to the Microsoft Graph v1.0 API
and returns the JSON response.

## Arguments

- `command`: path below https://graph.microsoft.com/v1.0, e.g. `me`, `users`,
  `groups?$top=10`. Absolute URLs and `..` segments are rejected.
- `method`: GET (default), POST, PUT, PATCH or DELETE.
- `data`: JSON body, sent for POST, PUT and PATCH only.
- `client_secret`: optional. Switches this one call to application permissions.

## Sign-in modes

Interactive (no client secret configured):
  Delegated, read-only access. The first call prints a verification URL and a
  code; open the URL, enter the code and the call continues. Only GET is allowed.

Application (AZURE_CLIENT_SECRET set, or `client_secret` passed per call):
  Client credentials against a concrete tenant. All methods are allowed, subject
  to the application permissions granted in Entra ID.

## Environment

- AZURE_CLIENT_ID      app registration id (defaults to the Graph PowerShell client)
- AZURE_TENANT_ID      tenant GUID or domain (defaults to `common`)
- AZURE_CLIENT_SECRET  client secret value, enables application mode
- GRAPH_SCOPES         delegated scopes, space or comma separated
- LOG_LEVEL            TRACE, DEBUG, INFO, WARNING, ERROR
- OPERATION_TIMEOUT    seconds to wait for interactive sign-in (default 300)
- GRAPH_TOKEN_CACHE    path of the token cache file

## Examples

Signed-in user:
    {"command": "me"}

First five users, selected fields:
    {"command": "users?$top=5&$select=displayName,mail"}

Update a user's job title (application mode):
    {"command": "users/adele@contoso.com", "method": "PATCH",
     "data": {"jobTitle": "Product Lead"}}

Create a security group (application mode):
    {"command": "groups", "method": "POST",
     "data": {"displayName": "Engineering", "mailEnabled": false,
              "mailNickname": "engineering", "securityEnabled": true}}

## Common endpoints

me, users, groups, devices, applications, servicePrincipals,
me/messages, me/events, me/drive/root/children, organization,
directoryRoles, auditLogs/signIns
"#;

pub fn help_resource() -> Resource {
    Resource {
        raw: RawResource {
            uri: HELP_URI.to_string(),
            name: "Microsoft Graph help".to_string(),
            title: None,
            description: Some(
                "Usage, sign-in modes, configuration and examples for graph_command.".to_string(),
            ),
            mime_type: Some("text/markdown".to_string()),
            size: None,
            icons: None,
        },
        annotations: None,
    }
}

pub fn list() -> Vec<Resource> {
    vec![help_resource()]
}

pub fn read(uri: &str) -> Result<Vec<ResourceContents>, GatewayError> {
    match uri {
        HELP_URI => Ok(vec![ResourceContents::text(HELP_TEXT, uri)]),
        _ => Err(GatewayError::ResourceNotFound),
    }
}
