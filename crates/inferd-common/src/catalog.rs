//! Static engine and model catalog.
//!
//! This is reference data for the orchestration core: the provisioner reads
//! recipes from it and the tracker joins model display names from it. It is
//! never written at runtime.

use crate::{Engine, Model, ModelVolume};

pub fn builtin_engines() -> Vec<Engine> {
    vec![
        Engine {
            id: "ollama".to_string(),
            name: "Ollama".to_string(),
            image: "ollama/ollama:latest".to_string(),
            internal_port: 11434,
            health_path: "/api/version".to_string(),
            model_volume: Some(ModelVolume {
                name: "inferd-ollama-models".to_string(),
                container_path: "/root/.ollama".to_string(),
            }),
            default_memory_mb: 4096,
            default_cpu_cores: 2.0,
            default_auto_stop_minutes: Some(30),
        },
        Engine {
            id: "speaches".to_string(),
            name: "Speaches".to_string(),
            image: "ghcr.io/speaches-ai/speaches:latest-cpu".to_string(),
            internal_port: 8000,
            health_path: "/health".to_string(),
            model_volume: Some(ModelVolume {
                name: "inferd-speaches-models".to_string(),
                container_path: "/home/ubuntu/.cache/huggingface".to_string(),
            }),
            default_memory_mb: 2048,
            default_cpu_cores: 2.0,
            default_auto_stop_minutes: Some(15),
        },
        Engine {
            id: "sdnext".to_string(),
            name: "SD.Next".to_string(),
            image: "saladtechnologies/sdnext:latest".to_string(),
            internal_port: 7860,
            health_path: "/sdapi/v1/status".to_string(),
            model_volume: Some(ModelVolume {
                name: "inferd-sdnext-models".to_string(),
                container_path: "/webui/models".to_string(),
            }),
            default_memory_mb: 8192,
            default_cpu_cores: 4.0,
            default_auto_stop_minutes: Some(30),
        },
    ]
}

pub fn builtin_models() -> Vec<Model> {
    vec![
        Model {
            id: "qwen2-0.5b".to_string(),
            engine_id: "ollama".to_string(),
            name: "qwen2:0.5b".to_string(),
            display_name: "Qwen2 0.5B".to_string(),
        },
        Model {
            id: "llama3.2-1b".to_string(),
            engine_id: "ollama".to_string(),
            name: "llama3.2:1b".to_string(),
            display_name: "Llama 3.2 1B".to_string(),
        },
        Model {
            id: "whisper-small".to_string(),
            engine_id: "speaches".to_string(),
            name: "Systran/faster-whisper-small".to_string(),
            display_name: "Whisper Small".to_string(),
        },
        Model {
            id: "sdxl-turbo".to_string(),
            engine_id: "sdnext".to_string(),
            name: "stabilityai/sdxl-turbo".to_string(),
            display_name: "SDXL Turbo".to_string(),
        },
    ]
}

pub fn engine_by_id(id: &str) -> Option<Engine> {
    builtin_engines().into_iter().find(|e| e.id == id)
}

pub fn model_by_id(id: &str) -> Option<Model> {
    builtin_models().into_iter().find(|m| m.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_id() {
        let engine = engine_by_id("ollama").expect("ollama engine should exist");
        assert_eq!(engine.internal_port, 11434);
        assert!(engine_by_id("no-such-engine").is_none());
    }

    #[test]
    fn test_models_reference_known_engines() {
        for model in builtin_models() {
            assert!(
                engine_by_id(&model.engine_id).is_some(),
                "model {} references unknown engine {}",
                model.id,
                model.engine_id
            );
        }
    }
}
