use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::EmailServiceError,
    models::{
        template::{CreateTemplateRequest, RenderedTemplate, Template, UpdateTemplateRequest},
        validation::{is_identifier, validate_template_name},
    },
    store::{TemplateCache, TemplateRepository},
};

/// Template CRUD plus rendering, with an optional read-through cache.
pub struct TemplateService {
    repository: Arc<dyn TemplateRepository>,
    cache: Option<Arc<dyn TemplateCache>>,
}

impl TemplateService {
    pub fn new(repository: Arc<dyn TemplateRepository>) -> Self {
        Self {
            repository,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn TemplateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn create(&self, request: CreateTemplateRequest) -> Result<Template, EmailServiceError> {
        let now = Utc::now();
        let template = Template {
            id: Uuid::new_v4(),
            name: request.name,
            subject: request.subject,
            body: request.body,
            variables: request.variables,
            description: request.description,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        check_template(&template)?;
        self.repository.insert(&template).await?;

        info!(template_id = %template.id, name = %template.name, "Template created");
        Ok(template)
    }

    pub async fn get(&self, id: Uuid) -> Result<Template, EmailServiceError> {
        if let Some(cache) = &self.cache {
            match cache.get(id).await {
                Ok(Some(template)) => {
                    debug!(template_id = %id, "Template cache hit");
                    return Ok(template);
                }
                Ok(None) => {}
                Err(e) => warn!(template_id = %id, error = %e, "Template cache read failed"),
            }
        }

        let template = self.repository.get(id).await?;

        if let Some(cache) = &self.cache
            && let Err(e) = cache.put(&template).await
        {
            warn!(template_id = %id, error = %e, "Template cache write failed");
        }

        Ok(template)
    }

    pub async fn update(
        &self,
        id: Uuid,
        patch: UpdateTemplateRequest,
    ) -> Result<Template, EmailServiceError> {
        let mut template = self.repository.get(id).await?;

        if let Some(name) = patch.name {
            template.name = name;
        }
        if let Some(subject) = patch.subject {
            template.subject = subject;
        }
        if let Some(body) = patch.body {
            template.body = body;
        }
        if let Some(variables) = patch.variables {
            template.variables = variables;
        }
        if let Some(description) = patch.description {
            template.description = description;
        }

        check_template(&template)?;
        template.updated_at = Utc::now();

        self.repository.update(&template).await?;
        self.invalidate(id).await;

        info!(template_id = %id, "Template updated");
        Ok(template)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), EmailServiceError> {
        self.repository.soft_delete(id, Utc::now()).await?;
        self.invalidate(id).await;

        info!(template_id = %id, "Template deleted");
        Ok(())
    }

    pub async fn render(
        &self,
        id: Uuid,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedTemplate, EmailServiceError> {
        let template = self.get(id).await?;
        render_template(&template, variables)
    }

    async fn invalidate(&self, id: Uuid) {
        if let Some(cache) = &self.cache
            && let Err(e) = cache.invalidate(id).await
        {
            warn!(template_id = %id, error = %e, "Template cache invalidation failed");
        }
    }
}

/// Substitutes every declared variable into subject and body.
///
/// Fails with `MissingVariable` naming the first declared variable absent
/// from `variables`. Extra keys are ignored.
pub fn render_template(
    template: &Template,
    variables: &HashMap<String, String>,
) -> Result<RenderedTemplate, EmailServiceError> {
    if let Some(missing) = template
        .variables
        .iter()
        .find(|name| !variables.contains_key(name.as_str()))
    {
        return Err(EmailServiceError::MissingVariable(missing.clone()));
    }

    Ok(RenderedTemplate {
        subject: render_text(&template.subject, variables),
        body: render_text(&template.body, variables),
    })
}

/// Names of every `{{identifier}}` placeholder in `text`, in order of appearance.
pub fn extract_placeholders(text: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match placeholder_at(after) {
            Some(name) => {
                names.push(name);
                rest = &after[name.len() + 2..];
            }
            None => rest = &rest[start + 1..],
        }
    }

    names
}

/// Identifier directly followed by `}}` at the start of `text`.
fn placeholder_at(text: &str) -> Option<&str> {
    let end = text.find("}}")?;
    let name = &text[..end];
    is_identifier(name).then_some(name)
}

/// Single left-to-right pass, so substituted values are never rescanned.
fn render_text(text: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match placeholder_at(after).and_then(|name| variables.get(name).map(|v| (name, v))) {
            Some((name, value)) => {
                out.push_str(&rest[..start]);
                out.push_str(value);
                rest = &after[name.len() + 2..];
            }
            None => {
                out.push_str(&rest[..start + 1]);
                rest = &rest[start + 1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn check_template(template: &Template) -> Result<(), EmailServiceError> {
    validate_template_name(&template.name)?;

    if template.subject.trim().is_empty() {
        return Err(EmailServiceError::InvalidTemplate(
            "subject cannot be empty".to_string(),
        ));
    }
    if template.subject.contains(['\r', '\n']) {
        return Err(EmailServiceError::InvalidTemplate(
            "subject cannot contain line breaks".to_string(),
        ));
    }
    if template.body.trim().is_empty() {
        return Err(EmailServiceError::InvalidTemplate(
            "body cannot be empty".to_string(),
        ));
    }

    for (i, name) in template.variables.iter().enumerate() {
        if !is_identifier(name) {
            return Err(EmailServiceError::InvalidTemplate(format!(
                "variable '{}' is not a valid identifier",
                name
            )));
        }
        if template.variables[..i].contains(name) {
            return Err(EmailServiceError::InvalidTemplate(format!(
                "variable '{}' is declared more than once",
                name
            )));
        }
    }

    let placeholders: Vec<&str> = extract_placeholders(&template.subject)
        .into_iter()
        .chain(extract_placeholders(&template.body))
        .collect();

    if let Some(undeclared) = placeholders
        .iter()
        .find(|name| !template.variables.iter().any(|v| v == *name))
    {
        return Err(EmailServiceError::InvalidTemplate(format!(
            "placeholder '{{{{{}}}}}' references an undeclared variable",
            undeclared
        )));
    }

    if let Some(unused) = template
        .variables
        .iter()
        .find(|name| !placeholders.contains(&name.as_str()))
    {
        return Err(EmailServiceError::InvalidTemplate(format!(
            "declared variable '{}' is never used",
            unused
        )));
    }

    Ok(())
}
