pub mod header;
pub mod tables;

use scraper::Html;
use serde::Serialize;

/// Process header block ("autuação") scraped from the top of the page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Autuacao {
    pub numero: String,
    pub tipo: String,
    pub data_geracao: Option<String>,
    pub interessado: String,
    pub acesso_restrito: bool,
}

/// One row of the protocol/document table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocolo {
    pub numero: String,
    pub tipo: String,
    pub data: Option<String>,
    pub data_inclusao: Option<String>,
    pub unidade: String,
}

/// One row of the timeline ("andamentos") table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Andamento {
    pub data_hora: Option<String>,
    pub unidade: String,
    pub descricao: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeResult {
    pub autuacao: Autuacao,
    pub protocolos: Vec<Protocolo>,
    pub andamentos: Vec<Andamento>,
}

/// Extract the three page regions from raw HTML. Pure function of the
/// content; malformed or missing sections degrade to empty values rather
/// than failing.
pub fn parse_sei(html: &str) -> ScrapeResult {
    let doc = Html::parse_document(html);
    ScrapeResult {
        autuacao: header::extract(&doc),
        protocolos: tables::extract_protocolos(&doc),
        andamentos: tables::extract_andamentos(&doc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{name}")).unwrap()
    }

    #[test]
    fn exemplo1_full_page() {
        let result = parse_sei(&fixture("exemplo1.html"));

        assert_eq!(result.autuacao.numero, "SEI-260002/002172/2025");
        assert_eq!(
            result.autuacao.tipo,
            "Administrativo: Elaboração de Correspondência Interna"
        );
        assert_eq!(result.autuacao.data_geracao.as_deref(), Some("2025-03-18"));
        assert!(result.autuacao.interessado.contains("UENF"));
        assert!(!result.autuacao.acesso_restrito);

        assert!(result.protocolos.len() >= 2);
        let p0 = &result.protocolos[0];
        assert_eq!(p0.numero, "95725517");
        assert!(p0.tipo.contains("Correspondência Interna"));
        assert_eq!(p0.data.as_deref(), Some("2025-03-19"));
        assert_eq!(p0.data_inclusao.as_deref(), Some("2025-03-19"));
        assert_eq!(p0.unidade, "UENF/DIRCCH");

        assert!(result.andamentos.len() >= 2);
        let a0 = &result.andamentos[0];
        assert_eq!(a0.unidade, "UENF/DIRCCH");
        assert!(a0.descricao.contains("recebido na unidade"));
        assert!(a0.data_hora.as_deref().unwrap().starts_with("2025-"));
    }

    #[test]
    fn restricted_page_degrades_to_empty_lists() {
        let result = parse_sei(&fixture("exemplo_restrito.html"));
        assert!(result.autuacao.acesso_restrito);
        assert_eq!(result.autuacao.numero, "SEI-070002/013015/2024");
        assert!(result.autuacao.tipo.contains("Administrativo"));
        assert_eq!(result.autuacao.data_geracao.as_deref(), Some("2024-07-16"));
        assert!(result.protocolos.is_empty());
        assert!(result.andamentos.is_empty());
    }

    #[test]
    fn deterministic_over_same_input() {
        let html = fixture("exemplo1.html");
        let a = parse_sei(&html);
        let b = parse_sei(&html);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn garbage_input_yields_empty_result() {
        let result = parse_sei("<html><body><p>nada aqui</p></body></html>");
        assert!(result.autuacao.numero.is_empty());
        assert!(result.autuacao.data_geracao.is_none());
        assert!(result.protocolos.is_empty());
        assert!(result.andamentos.is_empty());
    }
}
