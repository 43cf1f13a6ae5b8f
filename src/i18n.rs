use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    #[default]
    De,
    En,
}

impl Locale {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "de" | "de-de" | "de_de" => Some(Locale::De),
            "en" | "en-us" | "en-gb" | "en_us" | "en_gb" => Some(Locale::En),
            _ => None,
        }
    }
}

/// Why an import job as a whole was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    WrongEncoding,
    IllegalQuoting,
    UnknownError,
}

impl FailureReason {
    pub fn localized(self, locale: Locale) -> &'static str {
        match (self, locale) {
            (FailureReason::WrongEncoding, Locale::De) => {
                "Die Datei hat eine nicht lesbare Zeichenkodierung. Bitte speichere sie als UTF-8 oder Windows-1252 und lade sie erneut hoch."
            }
            (FailureReason::WrongEncoding, Locale::En) => {
                "The file uses an unreadable character encoding. Please save it as UTF-8 or Windows-1252 and upload it again."
            }
            (FailureReason::IllegalQuoting, Locale::De) => {
                "Die Datei enthält fehlerhafte Anführungszeichen oder Trennzeichen. Bitte prüfe das Semikolon-Format."
            }
            (FailureReason::IllegalQuoting, Locale::En) => {
                "The file contains malformed quotes or separators. Please check the semicolon-separated format."
            }
            (FailureReason::UnknownError, Locale::De) => {
                "Beim Verarbeiten der Datei ist ein unbekannter Fehler aufgetreten."
            }
            (FailureReason::UnknownError, Locale::En) => {
                "An unknown error occurred while processing the file."
            }
        }
    }
}

pub fn finished_label(locale: Locale) -> &'static str {
    match locale {
        Locale::De => "Dein Massen-Upload wurde verarbeitet.",
        Locale::En => "Your bulk upload has been processed.",
    }
}

pub fn failed_label(locale: Locale) -> &'static str {
    match locale {
        Locale::De => "Dein Massen-Upload ist fehlgeschlagen.",
        Locale::En => "Your bulk upload failed.",
    }
}

pub fn missing_messages_label(locale: Locale) -> &'static str {
    match locale {
        Locale::De => "Die Zeile konnte nicht importiert werden.",
        Locale::En => "The row could not be imported.",
    }
}
