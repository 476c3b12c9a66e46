use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::db;
use crate::parser::ScrapeResult;

/// Import failure. `UnresolvedParent` means the page carried no process
/// number and no existing row matched, so there is nothing to merge into.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("page has no process number and no existing record matches")]
    UnresolvedParent,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub processo_id: i64,
    pub numero: String,
    pub novos_protocolos: usize,
    pub novos_andamentos: usize,
    pub acesso_restrito: bool,
}

/// Merge one scraped page into the database. Re-running over the same
/// page is a no-op beyond the parent's `updated_at` touch.
pub fn import_scrape(
    conn: &Connection,
    scrape: &ScrapeResult,
    source_url: Option<&str>,
) -> Result<ImportOutcome, ImportError> {
    let autuacao = &scrape.autuacao;

    let processo_id = if autuacao.numero.is_empty() {
        // Restricted or stripped pages keep their number out of the HTML;
        // fall back to the row previously captured from this URL.
        match source_url {
            Some(url) => find_by_source(conn, url)?,
            None => None,
        }
        .ok_or(ImportError::UnresolvedParent)?
    } else {
        let upsert = db::ProcessoUpsert {
            numero: autuacao.numero.clone(),
            tipo: autuacao.tipo.clone(),
            interessado: autuacao.interessado.clone(),
            data_geracao: autuacao.data_geracao.clone(),
            source_url: source_url.map(str::to_owned),
        };
        match db::upsert_processo(conn, &upsert).map_err(ImportError::Storage)? {
            Some(id) => id,
            // RETURNING came back empty; resolve by the unique key instead.
            None => db::find_processo_id(conn, &autuacao.numero)
                .map_err(ImportError::Storage)?
                .ok_or(ImportError::UnresolvedParent)?,
        }
    };

    let protocolos: Vec<db::ProtocoloInsert> = scrape
        .protocolos
        .iter()
        .filter(|p| !p.numero.is_empty())
        .map(|p| db::ProtocoloInsert {
            numero: p.numero.clone(),
            tipo: p.tipo.clone(),
            data: p.data.clone(),
            data_inclusao: p.data_inclusao.clone(),
            unidade: non_empty(&p.unidade),
        })
        .collect();
    let andamentos: Vec<db::AndamentoInsert> = scrape
        .andamentos
        .iter()
        .filter(|a| !a.descricao.is_empty())
        .map(|a| db::AndamentoInsert {
            data_hora: a.data_hora.clone(),
            unidade: non_empty(&a.unidade),
            descricao: a.descricao.clone(),
        })
        .collect();

    let novos_protocolos =
        db::insert_protocolos(conn, processo_id, &protocolos).map_err(ImportError::Storage)?;
    let novos_andamentos =
        db::insert_andamentos(conn, processo_id, &andamentos).map_err(ImportError::Storage)?;
    db::refresh_derivados(conn, processo_id).map_err(ImportError::Storage)?;

    info!(
        component = "importer",
        processo_id,
        numero = %autuacao.numero,
        novos_protocolos,
        novos_andamentos,
        acesso_restrito = autuacao.acesso_restrito,
        "import merged"
    );

    Ok(ImportOutcome {
        processo_id,
        numero: autuacao.numero.clone(),
        novos_protocolos,
        novos_andamentos,
        acesso_restrito: autuacao.acesso_restrito,
    })
}

fn find_by_source(conn: &Connection, url: &str) -> Result<Option<i64>, ImportError> {
    let id = conn
        .query_row(
            "SELECT id FROM processos WHERE source_url = ?1 ORDER BY updated_at DESC LIMIT 1",
            [url],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(ImportError::Storage(other.into())),
        })?;
    Ok(id)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::{Andamento, Autuacao, Protocolo};

    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn scrape(numero: &str) -> ScrapeResult {
        ScrapeResult {
            autuacao: Autuacao {
                numero: numero.to_string(),
                tipo: "Administrativo".to_string(),
                data_geracao: Some("2025-03-18".to_string()),
                interessado: "UENF".to_string(),
                acesso_restrito: false,
            },
            protocolos: vec![Protocolo {
                numero: "95725517".to_string(),
                tipo: "Despacho".to_string(),
                data: Some("2025-03-19".to_string()),
                data_inclusao: Some("2025-03-19".to_string()),
                unidade: "UENF/DIRCCH".to_string(),
            }],
            andamentos: vec![Andamento {
                data_hora: Some("2025-03-19T12:00:00.000Z".to_string()),
                unidade: "UENF/DIRCCH".to_string(),
                descricao: "Processo recebido na unidade".to_string(),
            }],
        }
    }

    #[test]
    fn reimport_is_idempotent() {
        let conn = test_conn();
        let page = scrape("SEI-1/2025");

        let first = import_scrape(&conn, &page, Some("http://sei/p1")).unwrap();
        assert_eq!(first.novos_protocolos, 1);
        assert_eq!(first.novos_andamentos, 1);

        let second = import_scrape(&conn, &page, Some("http://sei/p1")).unwrap();
        assert_eq!(second.processo_id, first.processo_id);
        assert_eq!(second.novos_protocolos, 0);
        assert_eq!(second.novos_andamentos, 0);
    }

    #[test]
    fn incremental_merge_counts_only_new_children() {
        let conn = test_conn();
        let mut page = scrape("SEI-1/2025");
        import_scrape(&conn, &page, None).unwrap();

        page.andamentos.push(Andamento {
            data_hora: Some("2025-04-01T09:00:00.000Z".to_string()),
            unidade: "UENF/DGA".to_string(),
            descricao: "Processo remetido pela unidade".to_string(),
        });
        let outcome = import_scrape(&conn, &page, None).unwrap();
        assert_eq!(outcome.novos_protocolos, 0);
        assert_eq!(outcome.novos_andamentos, 1);

        let row = db::get_processo_by_numero(&conn, "SEI-1/2025")
            .unwrap()
            .unwrap();
        assert_eq!(row.data_ultimo_andamento.as_deref(), Some("2025-04-01"));
        assert_eq!(row.ultima_unidade.as_deref(), Some("UENF/DGA"));
    }

    #[test]
    fn restricted_page_resolves_parent_by_source_url() {
        let conn = test_conn();
        import_scrape(&conn, &scrape("SEI-1/2025"), Some("http://sei/p1")).unwrap();

        // Later fetch of the same URL yields a stripped page with no number.
        let stripped = ScrapeResult {
            autuacao: Autuacao {
                numero: String::new(),
                tipo: String::new(),
                data_geracao: None,
                interessado: String::new(),
                acesso_restrito: true,
            },
            protocolos: vec![],
            andamentos: vec![],
        };
        let outcome = import_scrape(&conn, &stripped, Some("http://sei/p1")).unwrap();
        assert_eq!(outcome.novos_protocolos, 0);
        assert!(outcome.acesso_restrito);
    }

    #[test]
    fn page_without_number_or_match_is_rejected() {
        let conn = test_conn();
        let stripped = ScrapeResult {
            autuacao: Autuacao {
                numero: String::new(),
                tipo: String::new(),
                data_geracao: None,
                interessado: String::new(),
                acesso_restrito: true,
            },
            protocolos: vec![],
            andamentos: vec![],
        };
        let err = import_scrape(&conn, &stripped, Some("http://sei/unknown")).unwrap_err();
        assert!(matches!(err, ImportError::UnresolvedParent));
    }

    #[test]
    fn blank_children_are_filtered_out() {
        let conn = test_conn();
        let mut page = scrape("SEI-1/2025");
        page.protocolos.push(Protocolo {
            numero: String::new(),
            tipo: "Ruído".to_string(),
            data: None,
            data_inclusao: None,
            unidade: String::new(),
        });
        page.andamentos.push(Andamento {
            data_hora: None,
            unidade: "UENF/DGA".to_string(),
            descricao: String::new(),
        });
        let outcome = import_scrape(&conn, &page, None).unwrap();
        assert_eq!(outcome.novos_protocolos, 1);
        assert_eq!(outcome.novos_andamentos, 1);
    }

    #[test]
    fn fixture_pages_merge_incrementally() {
        let conn = test_conn();
        let first = std::fs::read_to_string("tests/fixtures/exemplo1.html").unwrap();
        let second = std::fs::read_to_string("tests/fixtures/exemplo1_incremental.html").unwrap();

        let out = import_scrape(&conn, &crate::parser::parse_sei(&first), Some("http://sei/x"))
            .unwrap();
        assert_eq!(out.novos_protocolos, 2);
        assert_eq!(out.novos_andamentos, 3);

        let out = import_scrape(&conn, &crate::parser::parse_sei(&second), Some("http://sei/x"))
            .unwrap();
        assert_eq!(out.processo_id, 1);
        assert_eq!(out.novos_protocolos, 1);
        assert_eq!(out.novos_andamentos, 1);

        let row = db::get_processo_by_numero(&conn, "SEI-260002/002172/2025")
            .unwrap()
            .unwrap();
        assert_eq!(row.data_ultimo_andamento.as_deref(), Some("2025-04-02"));
        assert_eq!(row.ultima_unidade.as_deref(), Some("UENF/PROTOCOLO"));
    }

    #[test]
    fn empty_unidade_is_stored_as_null() {
        let conn = test_conn();
        let mut page = scrape("SEI-1/2025");
        page.andamentos[0].unidade = String::new();
        let outcome = import_scrape(&conn, &page, None).unwrap();
        let unidade: Option<String> = conn
            .query_row(
                "SELECT unidade FROM andamentos WHERE processo_id = ?1",
                [outcome.processo_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(unidade.is_none());
    }
}
