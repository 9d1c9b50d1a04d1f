use serde::{Deserialize, Serialize};

use crate::core::config::RetrievalSettings;
use crate::index::ChunkMetadata;

/// One prior turn of the conversation as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub text: String,
}

impl HistoryMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            text: text.into(),
        }
    }
}

pub fn format_history(history: &[HistoryMessage], settings: &RetrievalSettings) -> String {
    history
        .iter()
        .map(|message| {
            let speaker = if message.role == "user" {
                &settings.user_label
            } else {
                &settings.assistant_name
            };
            format!("{}: {}", speaker, message.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assembles the tutoring prompt: persona, subject, recent history, retrieved
/// context (or a plain-answer instruction when there is none), then the
/// question and the answer cue.
pub fn build_prompt(
    question: &str,
    subject: &str,
    context: &[ChunkMetadata],
    history: &[HistoryMessage],
    settings: &RetrievalSettings,
) -> String {
    let english = subject == settings.english_subject;
    let name = &settings.assistant_name;
    let mut sections = Vec::new();

    if english {
        sections.push(format!(
            "You are {}, a helpful English tutor. Always respond in English. \
             Keep your answers clear, short, and friendly. \
             Use simple examples suitable for students.",
            name
        ));
        sections.push("Subject: English".to_string());
    } else {
        sections.push(format!(
            "Tu nombre es {}, un asistente educativo en español. \
             Responde siempre de forma clara, breve y amable, usando ejemplos sencillos.",
            name
        ));
        let shown = if subject.is_empty() { "general" } else { subject };
        sections.push(format!("Materia seleccionada: {}", shown));
    }

    let history_text = format_history(history, settings);
    if !history_text.is_empty() {
        sections.push(format!("Historial reciente:\n{}", history_text));
    }

    let context_text = context
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let instruction = match (english, context_text.is_empty()) {
        (true, false) => format!(
            "Use the following context to answer the user's question.\n\
             If the answer is not in the context, use your general knowledge but mention it.\n\
             Context:\n{}",
            context_text
        ),
        (false, false) => format!(
            "Usa la siguiente información de contexto para responder a la pregunta del usuario.\n\
             Si la respuesta no está en el contexto, usa tu conocimiento general pero menciónalo.\n\
             Contexto:\n{}",
            context_text
        ),
        (true, true) => "Answer the following question in a friendly and educational tone.".to_string(),
        (false, true) => "Responde a la siguiente pregunta en un tono didáctico y amable, \
                          adecuado para niños o estudiantes."
            .to_string(),
    };
    sections.push(instruction);

    sections.push(format!("Pregunta: {}", question));
    sections.push("Respuesta:".to_string());
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> ChunkMetadata {
        ChunkMetadata {
            subject: "Matematicas".to_string(),
            source: "derivadas.txt".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn spanish_prompt_with_context_and_history() {
        let settings = RetrievalSettings::default();
        let history = vec![
            HistoryMessage::user("Hola"),
            HistoryMessage::assistant("¡Hola! ¿En qué te ayudo?"),
        ];
        let prompt = build_prompt(
            "¿Qué es una derivada?",
            "Matematicas",
            &[chunk("La derivada mide el cambio.")],
            &history,
            &settings,
        );

        assert!(prompt.starts_with("Tu nombre es Inti"));
        assert!(prompt.contains("Materia seleccionada: Matematicas"));
        assert!(prompt.contains("Historial reciente:\nUsuario: Hola\nInti: ¡Hola! ¿En qué te ayudo?"));
        assert!(prompt.contains("Contexto:\nLa derivada mide el cambio."));
        assert!(prompt.ends_with("Pregunta: ¿Qué es una derivada?\n\nRespuesta:"));
    }

    #[test]
    fn english_subject_switches_persona() {
        let settings = RetrievalSettings::default();
        let prompt = build_prompt("How do I say perro?", "Ingles", &[], &[], &settings);

        assert!(prompt.starts_with("You are Inti, a helpful English tutor."));
        assert!(prompt.contains("Subject: English"));
        assert!(prompt.contains("Answer the following question"));
        assert!(!prompt.contains("Historial"));
    }

    #[test]
    fn speaker_labels_are_configurable() {
        let settings = RetrievalSettings {
            user_label: "Alumno".to_string(),
            assistant_name: "Tutor".to_string(),
            ..RetrievalSettings::default()
        };
        let history = vec![HistoryMessage::user("x"), HistoryMessage::assistant("y")];
        assert_eq!(format_history(&history, &settings), "Alumno: x\nTutor: y");
    }
}
