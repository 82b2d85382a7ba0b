/// Builds the admin console link that grants the service account domain-wide delegation.
///
/// Scopes are joined with `,` and percent-encoded as a single value, so the
/// console receives them as one `clientScopeToAdd` parameter.
pub fn authorize_url(template: &str, client_id: &str, scopes: &[String]) -> String {
    let scopes = urlencoding::encode(&scopes.join(",")).into_owned();
    template
        .replace("{client_id}", client_id)
        .replace("{scopes}", &scopes)
}
