//! BNB (building characteristics) preprocessing

use polars::prelude::*;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::data::catalog::{BNB_BUILDING_KEY, BNB_PARCEL_KEY, LIST_VALUED_VARS};
use crate::data::csv_loader::{read_csv, read_parquet, write_parquet};
use crate::data::frame::{
    drop_column, filter_rows, float_column, has_column, left_join, rendered, select_columns,
    set_column, text_values,
};
use crate::error::{PipelineError, Result};

/// Field-specific BNB tables, all keyed by `batiment_groupe_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildingSource {
    RelParcelle,
    BatimentGroupe,
    Argiles,
    BdtopoBat,
    Dpe,
    DpeLogtype,
    Merimee,
    Qpv,
    Radon,
    Rnc,
}

impl BuildingSource {
    pub const ALL: [BuildingSource; 10] = [
        BuildingSource::RelParcelle,
        BuildingSource::BatimentGroupe,
        BuildingSource::Argiles,
        BuildingSource::BdtopoBat,
        BuildingSource::Dpe,
        BuildingSource::DpeLogtype,
        BuildingSource::Merimee,
        BuildingSource::Qpv,
        BuildingSource::Radon,
        BuildingSource::Rnc,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            BuildingSource::RelParcelle => "rel_batiment_groupe_parcelle",
            BuildingSource::BatimentGroupe => "batiment_groupe",
            BuildingSource::Argiles => "batiment_groupe_argiles",
            BuildingSource::BdtopoBat => "batiment_groupe_bdtopo_bat",
            BuildingSource::Dpe => "batiment_groupe_dpe",
            BuildingSource::DpeLogtype => "batiment_groupe_dpe_logtype",
            BuildingSource::Merimee => "batiment_groupe_merimee",
            BuildingSource::Qpv => "batiment_groupe_qpv",
            BuildingSource::Radon => "batiment_groupe_radon",
            BuildingSource::Rnc => "batiment_groupe_rnc",
        }
    }

    /// Columns read from the source, key included
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            BuildingSource::RelParcelle => &["batiment_groupe_id", "parcelle_id"],
            BuildingSource::BatimentGroupe => &["batiment_groupe_id", "code_iris"],
            BuildingSource::Argiles | BuildingSource::Radon => &["batiment_groupe_id", "alea"],
            BuildingSource::BdtopoBat => &[
                "batiment_groupe_id",
                "l_etat",
                "hauteur_mean",
                "altitude_sol_mean",
            ],
            BuildingSource::Dpe => &[
                "batiment_groupe_id",
                "nb_classe_ener_a",
                "nb_classe_ener_b",
                "nb_classe_ener_c",
                "nb_classe_ener_d",
                "nb_classe_ener_e",
                "nb_classe_ener_f",
                "nb_classe_ener_g",
                "nb_classe_ener_nc",
                "nb_classe_ges_a",
                "nb_classe_ges_b",
                "nb_classe_ges_c",
                "nb_classe_ges_d",
                "nb_classe_ges_e",
                "nb_classe_ges_f",
                "nb_classe_ges_g",
                "nb_classe_ges_nc",
                "conso_ener_mean",
                "estim_ges_mean",
                "conso_ener_std",
                "estim_ges_std",
                "conso_ener_min",
                "estim_ges_min",
                "conso_ener_max",
                "estim_ges_max",
            ],
            BuildingSource::DpeLogtype => &[
                "batiment_groupe_id",
                "baie_orientation",
                "baie_type_vitrage",
                "baie_u",
                "ch_solaire",
                "ch_type_ener_corr",
                "enr",
                "mur_pos_isol_ext",
                "mur_u_ext",
                "pb_u",
                "prc_s_vitree_ext",
                "periode_construction",
                "ph_pos_isol",
                "ph_u",
                "presence_balcon",
                "presence_climatisation",
                "type_batiment",
                "type_ventilation",
                "ratio_ges_conso",
            ],
            BuildingSource::Merimee => &[
                "batiment_groupe_id",
                "distance_batiment_historique_plus_proche",
                "nom_batiment_historique_plus_proche",
            ],
            BuildingSource::Qpv => &["batiment_groupe_id", "nom_quartier"],
            BuildingSource::Rnc => &[
                "batiment_groupe_id",
                "periode_construction_max",
                "l_annee_construction",
                "nb_lot_garpark",
                "nb_lot_tot",
                "nb_log",
                "nb_lot_tertiaire",
            ],
        }
    }

    /// Source column renamed on load, so both risk tables can coexist
    pub fn rename(&self) -> Option<(&'static str, &'static str)> {
        match self {
            BuildingSource::Argiles => Some(("alea", "alea_argiles")),
            BuildingSource::Radon => Some(("alea", "alea_radon")),
            _ => None,
        }
    }

    /// Column names this source contributes after renaming, key excluded
    pub fn output_columns(&self) -> Vec<&'static str> {
        self.columns()
            .iter()
            .filter(|c| **c != BNB_BUILDING_KEY)
            .map(|c| match self.rename() {
                Some((from, to)) if *c == from => to,
                _ => *c,
            })
            .collect()
    }
}

impl fmt::Display for BuildingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

impl FromStr for BuildingSource {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        BuildingSource::ALL
            .into_iter()
            .find(|src| src.file_stem() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = BuildingSource::ALL.iter().map(|s| s.file_stem()).collect();
                PipelineError::Validation(format!("{} is not one of {:?}", s, known))
            })
    }
}

/// Missing text cells become empty strings
pub fn normalize_text(df: &DataFrame) -> Result<DataFrame> {
    let fills: Vec<Expr> = df
        .get_columns()
        .iter()
        .filter(|c| c.dtype() == &DataType::String)
        .map(|c| col(c.name().as_str()).fill_null(lit("")))
        .collect();
    if fills.is_empty() {
        return Ok(df.clone());
    }
    Ok(df.clone().lazy().with_columns(fills).collect()?)
}

/// Keep the source's columns and apply its rename
pub fn shape_source(source: BuildingSource, raw: &DataFrame) -> Result<DataFrame> {
    if let Some(missing) = source.columns().iter().find(|c| !has_column(raw, c)) {
        return Err(PipelineError::Schema(format!("{}.{}", source, missing)));
    }
    let mut df = select_columns(raw, source.columns())?;
    if let Some((from, to)) = source.rename() {
        df.rename(from, to.into())?;
    }
    Ok(df)
}

fn load_source(root: &Path, source: BuildingSource) -> Result<DataFrame> {
    let path = root.join(format!("{}.csv", source.file_stem()));
    let raw = read_csv(&path)?;
    debug!("Loaded {} rows from {:?}", raw.height(), path);
    shape_source(source, &raw)
}

/// Left-join shaped source frames onto `base` (or onto the first part)
pub fn merge_sources(base: Option<DataFrame>, parts: Vec<DataFrame>) -> Result<DataFrame> {
    let mut parts = parts.into_iter();
    let mut merged = match base {
        Some(b) => b,
        None => match parts.next() {
            Some(first) => first,
            None => return Ok(DataFrame::empty()),
        },
    };
    for part in parts {
        merged = left_join(&merged, &part, &[BNB_BUILDING_KEY], &[BNB_BUILDING_KEY], "_dup")?;
    }
    normalize_text(&merged)
}

/// Read each source under `root` and merge them into one wide frame
pub fn load_and_merge_chunks(root: &Path, sources: &[BuildingSource]) -> Result<DataFrame> {
    let parts = sources
        .iter()
        .map(|s| load_source(root, *s))
        .collect::<Result<Vec<_>>>()?;
    merge_sources(None, parts)
}

/// Merge sources into a parquet cache.
///
/// An existing cache is loaded and only extended with sources whose
/// columns it does not hold yet; the cache is rewritten after each merge.
pub fn make_dataset(
    root: &Path,
    sources: &[BuildingSource],
    cache: &Path,
) -> Result<DataFrame> {
    if cache.extension().and_then(|e| e.to_str()) != Some("parquet") {
        return Err(PipelineError::Validation(format!(
            "cache file {} must have a .parquet extension",
            cache.display()
        )));
    }

    let mut merged = if cache.exists() {
        info!("Load {:?}...", cache);
        Some(read_parquet(cache)?)
    } else {
        None
    };

    for source in sources {
        if let Some(existing) = &merged {
            if source.output_columns().iter().all(|c| has_column(existing, c)) {
                debug!("{} already cached, skipping", source);
                continue;
            }
        }
        info!("Process {}...", source);
        let part = load_source(root, *source)?;
        let next = merge_sources(merged.take(), vec![part])?;
        info!("Save updated {:?}...", cache);
        write_parquet(&next, cache)?;
        merged = Some(next);
    }

    Ok(merged.unwrap_or_else(DataFrame::empty))
}

/// Parse a serialized list cell such as `['nord', 'est ou ouest']`
pub fn parse_list_cell(cell: &str) -> Option<Vec<String>> {
    let inner = cell.trim().strip_prefix('[')?.strip_suffix(']')?;
    Some(
        inner
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

/// `{column}_{level}` with the level lowercased and spaces replaced
pub fn level_column_name(column: &str, level: &str) -> String {
    format!("{}_{}", column, level.to_lowercase().replace(' ', "_"))
}

/// Replace a list-valued column by one 0/1 indicator per known level.
///
/// Cells that do not parse as a list count as holding no level.
pub fn expand_list_valued_column(
    df: &DataFrame,
    column: &str,
    levels: &[&str],
) -> Result<DataFrame> {
    let cells = text_values(df, column)?;
    let parsed: Vec<Option<Vec<String>>> = cells
        .iter()
        .map(|c| c.as_deref().and_then(parse_list_cell))
        .collect();

    let unparseable = cells
        .iter()
        .zip(&parsed)
        .filter(|(c, p)| p.is_none() && c.as_deref().is_some_and(|s| !s.trim().is_empty()))
        .count();
    if unparseable > 0 {
        warn!(
            "{}: {} cells are not lists, treated as holding no level",
            column, unparseable
        );
    }

    let mut out = drop_column(df.clone(), column)?;
    for level in levels {
        let values = parsed
            .iter()
            .map(|p| {
                let hit = p
                    .as_ref()
                    .is_some_and(|items| items.iter().any(|i| i.eq_ignore_ascii_case(level)));
                Some(if hit { 1.0 } else { 0.0 })
            })
            .collect();
        out = set_column(out, float_column(&level_column_name(column, level), values))?;
    }
    Ok(out)
}

/// Drop repeated parcel ids, first occurrence wins. Rows without a parcel
/// id cannot be joined and are dropped too.
pub fn dedup_by_parcel(df: &DataFrame, key: &str) -> Result<DataFrame> {
    let keys = text_values(df, key)?;
    let mut seen = HashSet::with_capacity(keys.len());
    let mask: Vec<bool> = keys
        .iter()
        .map(|k| match k {
            Some(k) => seen.insert(k.as_str()),
            None => false,
        })
        .collect();
    let dropped = mask.iter().filter(|k| !**k).count();
    if dropped > 0 {
        info!("{} duplicated or empty {} rows removed", dropped, key);
    }
    filter_rows(df, &mask)
}

/// `qpv = 1` iff the priority-neighborhood name is non-empty
pub fn derive_flags(df: &DataFrame) -> Result<DataFrame> {
    let Some(names) = df.column("nom_quartier").ok() else {
        debug!("nom_quartier absent, qpv flag not derived");
        return Ok(df.clone());
    };
    let qpv = rendered(names)?
        .iter()
        .map(|n| Some(if n.as_deref().is_some_and(|s| !s.trim().is_empty()) { 1.0 } else { 0.0 }))
        .collect();
    set_column(df.clone(), float_column("qpv", qpv))
}

/// List expansion, flags and parcel dedup: the building frame ready to join
pub fn finalize(df: &DataFrame) -> Result<DataFrame> {
    let mut out = df.clone();
    for (column, levels) in LIST_VALUED_VARS {
        if has_column(&out, column) {
            out = expand_list_valued_column(&out, column, levels)?;
        }
    }
    out = derive_flags(&out)?;
    if has_column(&out, BNB_PARCEL_KEY) {
        out = dedup_by_parcel(&out, BNB_PARCEL_KEY)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::{column_names, f64_values};
    use std::fs;

    #[test]
    fn test_parse_list_cell() {
        assert_eq!(
            parse_list_cell("['nord', 'est ou ouest']"),
            Some(vec!["nord".to_string(), "est ou ouest".to_string()])
        );
        assert_eq!(parse_list_cell("[]"), Some(vec![]));
        assert_eq!(parse_list_cell("nord"), None);
    }

    #[test]
    fn test_expand_list_valued_column() {
        let df = df!(
            "baie_orientation" => &[
                Some("['nord', 'sud']"),
                Some("garbage"),
                None,
                Some("[\"est ou ouest\"]"),
            ]
        )
        .unwrap();

        let out =
            expand_list_valued_column(&df, "baie_orientation", &["nord", "sud", "est ou ouest"]).unwrap();
        assert!(!has_column(&out, "baie_orientation"));
        assert_eq!(
            f64_values(&out, "baie_orientation_nord").unwrap(),
            vec![Some(1.0), Some(0.0), Some(0.0), Some(0.0)]
        );
        assert_eq!(
            f64_values(&out, "baie_orientation_est_ou_ouest").unwrap(),
            vec![Some(0.0), Some(0.0), Some(0.0), Some(1.0)]
        );
    }

    #[test]
    fn test_dedup_by_parcel_keeps_first() {
        let df = df!(
            "parcelle_id" => &[Some("p1"), Some("p2"), Some("p1"), None],
            "hauteur_mean" => &[1.0, 2.0, 3.0, 4.0]
        )
        .unwrap();
        let out = dedup_by_parcel(&df, "parcelle_id").unwrap();
        assert_eq!(f64_values(&out, "hauteur_mean").unwrap(), vec![Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_derive_flags() {
        let df = df!("nom_quartier" => &[Some("Belleville"), Some(""), None]).unwrap();
        let out = derive_flags(&df).unwrap();
        assert_eq!(f64_values(&out, "qpv").unwrap(), vec![Some(1.0), Some(0.0), Some(0.0)]);
        assert_eq!(derive_flags(&df!("x" => &[1.0]).unwrap()).unwrap().width(), 1);
    }

    #[test]
    fn test_shape_source_renames() {
        let raw = df!(
            "batiment_groupe_id" => &["b1"],
            "alea" => &["Fort"],
            "ignored" => &[0.0]
        )
        .unwrap();
        let shaped = shape_source(BuildingSource::Radon, &raw).unwrap();
        assert_eq!(column_names(&shaped), vec!["batiment_groupe_id", "alea_radon"]);
        assert!(shape_source(BuildingSource::Qpv, &raw).is_err());
    }

    #[test]
    fn test_make_dataset_extends_cache() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("rel_batiment_groupe_parcelle.csv"),
            "batiment_groupe_id,parcelle_id\nb1,p1\nb2,p2\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("batiment_groupe_qpv.csv"),
            "batiment_groupe_id,nom_quartier\nb2,Belleville\n",
        )
        .unwrap();
        let cache = dir.path().join("bnb.parquet");

        let first = make_dataset(dir.path(), &[BuildingSource::RelParcelle], &cache).unwrap();
        assert_eq!(first.width(), 2);
        assert!(cache.exists());

        let second = make_dataset(
            dir.path(),
            &[BuildingSource::RelParcelle, BuildingSource::Qpv],
            &cache,
        )
        .unwrap();
        assert_eq!(second.height(), 2);
        assert_eq!(
            text_values(&second, "nom_quartier").unwrap(),
            vec![Some(String::new()), Some("Belleville".to_string())]
        );

        assert!(make_dataset(dir.path(), &[], &dir.path().join("bnb.csv")).is_err());
    }

    #[test]
    fn test_source_from_str() {
        assert_eq!(
            "batiment_groupe_dpe".parse::<BuildingSource>().unwrap(),
            BuildingSource::Dpe
        );
        assert!("nope".parse::<BuildingSource>().is_err());
    }
}
