//! Tipos de erro para o cliente do serviço de detecção.
//!
//! Define [`DetectionError`] com variantes para as duas etapas da chamada
//! (download da imagem e inferência) mais cancelamento e prazo esgotado.
//! Cada variante é classificada como transitória ou permanente via
//! [`DetectionError::class`].

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorClass;

/// Erros que podem ocorrer durante `detect`.
///
/// - Falhas de download são sempre transitórias: o armazenamento de imagens
///   pode ainda não estar consistente.
/// - [`Rejected`](DetectionError::Rejected) e
///   [`MalformedResponse`](DetectionError::MalformedResponse) são permanentes:
///   o serviço recebeu a requisição e a recusou ou violou o próprio contrato.
/// - [`Cancelled`](DetectionError::Cancelled) não é uma falha do job; quem
///   chama deve tratá-lo à parte.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// O host da imagem respondeu com status fora da faixa 2xx.
    #[error("image download returned status {status}")]
    DownloadStatus { status: u16 },

    /// Falha de rede ao baixar ou ler a imagem.
    #[error("image download failed: {0}")]
    Download(#[source] reqwest::Error),

    /// A tarefa de download terminou sem entregar resultado.
    #[error("image download task ended without a result")]
    DownloadInterrupted,

    /// O POST para o serviço falhou antes de obter uma resposta.
    #[error("detection request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// O serviço respondeu com status fora da faixa 2xx.
    /// Guarda o código e o corpo bruto para diagnóstico.
    #[error("detection service returned status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Resposta 2xx cujo corpo não tem o formato esperado.
    #[error("failed to decode detection response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    /// O prazo configurado para a chamada inteira se esgotou.
    #[error("detection timed out after {0:?}")]
    Timeout(Duration),

    /// O token de cancelamento disparou durante a chamada.
    #[error("detection cancelled")]
    Cancelled,
}

impl DetectionError {
    /// Classificação usada pelo dispatcher para decidir o requeue.
    ///
    /// `Cancelled` é reportado como transitório; confira
    /// [`is_cancelled`](Self::is_cancelled) antes.
    pub fn class(&self) -> ErrorClass {
        match self {
            DetectionError::Rejected { .. } | DetectionError::MalformedResponse(_) => {
                ErrorClass::Permanent
            }
            DetectionError::DownloadStatus { .. }
            | DetectionError::Download(_)
            | DetectionError::DownloadInterrupted
            | DetectionError::Transport(_)
            | DetectionError::Timeout(_)
            | DetectionError::Cancelled => ErrorClass::Transient,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DetectionError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_carries_status_and_body() {
        let err = DetectionError::Rejected {
            status: 500,
            body: "internal error".into(),
        };
        assert_eq!(
            err.to_string(),
            "detection service returned status 500: internal error"
        );
    }

    #[test]
    fn download_status_display() {
        let err = DetectionError::DownloadStatus { status: 404 };
        assert_eq!(err.to_string(), "image download returned status 404");
    }

    #[test]
    fn classification() {
        assert_eq!(
            DetectionError::DownloadStatus { status: 404 }.class(),
            ErrorClass::Transient
        );
        assert_eq!(
            DetectionError::Timeout(Duration::from_secs(30)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            DetectionError::Rejected {
                status: 401,
                body: String::new()
            }
            .class(),
            ErrorClass::Permanent
        );
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(
            DetectionError::MalformedResponse(parse).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn only_cancelled_is_cancelled() {
        assert!(DetectionError::Cancelled.is_cancelled());
        assert!(!DetectionError::DownloadInterrupted.is_cancelled());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DetectionError>();
    }
}
