use super::resources::ResourceType;
use crate::fingerprint::Params;
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://comicvine.gamespot.com/api/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrieveOptions {
    pub field_list: Vec<String>,
}

impl RetrieveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_list.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn to_params(&self) -> Params {
        Params::new().set_opt("field_list", join(&self.field_list))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub field_list: Vec<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort: Option<(String, SortDirection)>,
    pub filter: Vec<(String, String)>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_list.extend(fields.into_iter().map(Into::into));
        self
    }

    /// The API caps pages at 100 results.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit.clamp(1, 100));
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.push((field.into(), value.into()));
        self
    }

    pub fn to_params(&self) -> Params {
        let filter = (!self.filter.is_empty()).then(|| {
            self.filter
                .iter()
                .map(|(field, value)| format!("{field}:{value}"))
                .collect::<Vec<_>>()
                .join(",")
        });
        Params::new()
            .set_opt("field_list", join(&self.field_list))
            .set_opt("limit", self.limit)
            .set_opt("offset", self.offset)
            .set_opt(
                "sort",
                self.sort
                    .as_ref()
                    .map(|(field, dir)| format!("{field}:{}", dir.as_str())),
            )
            .set_opt("filter", filter)
    }
}

fn join(fields: &[String]) -> Option<String> {
    (!fields.is_empty()).then(|| fields.join(","))
}

/// Renders endpoints into fully-qualified request URLs.
///
/// The API key is appended here and never takes part in request fingerprints.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base: Url,
    api_key: String,
}

impl UrlBuilder {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base: &str, api_key: impl Into<String>) -> Result<Self> {
        let mut base = Url::parse(base).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base URL: {e}"),
                ErrorContext::new()
                    .with_field_path("client.base_url")
                    .with_details(base.to_string()),
            )
        })?;
        // Without the trailing slash `join` would replace the last path segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `endpoint` is relative to the base, e.g. `issue/4000-6/`.
    pub fn url(&self, endpoint: &str, params: &Params) -> Result<Url> {
        let mut url = self
            .base
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| {
                Error::validation_with_context(
                    format!("invalid endpoint: {e}"),
                    ErrorContext::new().with_details(endpoint.to_string()),
                )
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api_key", &self.api_key);
            query.append_pair("format", "json");
            for (key, value) in params.iter() {
                match value {
                    Value::Null => {}
                    Value::String(s) => {
                        query.append_pair(key, s);
                    }
                    other => {
                        query.append_pair(key, &other.to_string());
                    }
                }
            }
        }
        Ok(url)
    }

    pub fn retrieve(&self, resource: ResourceType, id: u64, options: &RetrieveOptions) -> Result<Url> {
        self.url(&resource.detail_path(id), &options.to_params())
    }

    pub fn list(&self, resource: ResourceType, options: &ListOptions) -> Result<Url> {
        self.url(&resource.list_path(), &options.to_params())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_retrieve_url() {
        let builder = UrlBuilder::new("KEY").unwrap();
        let url = builder
            .retrieve(
                ResourceType::Issue,
                6,
                &RetrieveOptions::new().with_fields(["id", "name"]),
            )
            .unwrap();
        assert_eq!(url.path(), "/api/issue/4000-6/");
        let pairs = query(&url);
        assert!(pairs.contains(&("api_key".into(), "KEY".into())));
        assert!(pairs.contains(&("format".into(), "json".into())));
        assert!(pairs.contains(&("field_list".into(), "id,name".into())));
    }

    #[test]
    fn test_list_url() {
        let builder = UrlBuilder::with_base_url("http://localhost:1234/api", "KEY").unwrap();
        let options = ListOptions::new()
            .with_limit(500)
            .with_offset(100)
            .sort_by("cover_date", SortDirection::Desc)
            .filter("name", "Batman")
            .filter("volume", "796");
        let url = builder.list(ResourceType::Issue, &options).unwrap();
        assert_eq!(url.path(), "/api/issues/");
        let pairs = query(&url);
        assert!(pairs.contains(&("limit".into(), "100".into())));
        assert!(pairs.contains(&("offset".into(), "100".into())));
        assert!(pairs.contains(&("sort".into(), "cover_date:desc".into())));
        assert!(pairs.contains(&("filter".into(), "name:Batman,volume:796".into())));
    }

    #[test]
    fn test_options_without_values_add_no_params() {
        assert!(ListOptions::new().to_params().is_empty());
        assert!(RetrieveOptions::new().to_params().is_empty());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(UrlBuilder::with_base_url("not a url", "KEY").is_err());
    }
}
