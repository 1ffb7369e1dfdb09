use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Result, StashError};
use crate::stations::{StationCollection, StationRecord};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormMode {
    #[default]
    Add,
    Edit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormField {
    Url,
    Name,
    Description,
}

/// Add/edit dialog state.  `original_url` is only set in edit mode and
/// locates the record to overwrite, so the URL itself can be renamed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FormSession {
    pub is_open: bool,
    pub mode: FormMode,
    pub working_copy: StationRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

impl FormSession {
    pub fn open_add(&mut self) {
        self.mode = FormMode::Add;
        self.working_copy = StationRecord::default();
        self.original_url = None;
        self.is_open = true;
    }

    /// On a missing `url` the session is left exactly as it was.
    pub fn open_edit(&mut self, collection: &StationCollection, url: &str) -> Result<()> {
        let Some(station) = collection.get(url) else {
            error!("Station with URL \"{}\" not found for editing", url);
            return Err(StashError::StationNotFound {
                url: url.to_string(),
            });
        };
        self.mode = FormMode::Edit;
        self.working_copy = station.clone();
        self.original_url = Some(station.url.clone());
        self.is_open = true;
        Ok(())
    }

    /// No validation here; `submit` checks the result.
    pub fn update_field(&mut self, field: FormField, value: impl Into<String>) {
        let value = value.into();
        match field {
            FormField::Url => self.working_copy.url = value,
            FormField::Name => self.working_copy.name = value,
            FormField::Description => self.working_copy.description = value,
        }
    }

    /// Discard unsaved edits.
    pub fn reset(&mut self, collection: &StationCollection) {
        self.working_copy = match (self.mode, self.original_url.as_deref()) {
            (FormMode::Edit, Some(url)) => collection.get(url).cloned().unwrap_or_default(),
            _ => StationRecord::default(),
        };
    }

    /// Write the working copy into the collection.  The session closes on
    /// success and stays open on any failure so the input can be fixed.
    pub fn submit(&mut self, collection: &mut StationCollection) -> Result<()> {
        if self.working_copy.url.trim().is_empty() {
            return Err(StashError::EmptyUrl);
        }
        match self.mode {
            FormMode::Add => collection.add(self.working_copy.clone())?,
            FormMode::Edit => {
                let original = self
                    .original_url
                    .clone()
                    .ok_or_else(|| StashError::StationNotFound {
                        url: self.working_copy.url.clone(),
                    })?;
                collection.update(&original, self.working_copy.clone())?;
            }
        }
        self.is_open = false;
        Ok(())
    }

    /// Hide the dialog; the working copy is left as is.
    pub fn close(&mut self) {
        self.is_open = false;
    }
}
