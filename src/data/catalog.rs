//! Known variables and the feature catalog threaded through preparation

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use super::frame::{self, column_names, has_column};
use crate::error::{PipelineError, Result};

pub const DVF_PARCEL_KEY: &str = "id_parcelle";
pub const BNB_PARCEL_KEY: &str = "parcelle_id";
pub const BNB_BUILDING_KEY: &str = "batiment_groupe_id";

pub const PRICE_VAR: &str = "valeur_fonciere";
pub const LOG_PRICE_VAR: &str = "l_valeur_fonciere";
pub const PRICE_M2_VAR: &str = "valeur_fonciere_m2";
pub const SURFACE_VAR: &str = "surface_reelle_bati";
pub const FIELD_SURFACE_VAR: &str = "surface_terrain";
pub const ROOMS_VAR: &str = "nombre_pieces_principales";
pub const DATE_VAR: &str = "date_mutation";
pub const COMMUNE_VAR: &str = "nom_commune";
pub const IRIS_VAR: &str = "code_iris";
pub const DEPENDENCY_VAR: &str = "dependance";
pub const WINDOW_ORIENTATION: &str = "baie_orientation";
pub const WINDOW_INDETERMINATE: &str = "baie_orientation_indetermine";

pub const DVF_SELECTED_VARS: &[&str] = &[
    "id_mutation",
    "date_mutation",
    "valeur_fonciere",
    "nom_commune",
    "surface_reelle_bati",
    "nombre_pieces_principales",
    "surface_terrain",
    "dependance",
    "trimestre",
    "mois",
];

/// Address and location columns, kept only for inference lookups
pub const DVF_LOCATION_VARS: &[&str] = &[
    "adresse_numero",
    "adresse_nom_voie",
    "code_postal",
    "code_commune",
    "code_departement",
    "latitude",
    "longitude",
];

pub const BNB_SELECTED_VARS: &[&str] = &[
    "code_iris",
    "periode_construction",
    "periode_construction_max",
    "hauteur_mean",
    "altitude_sol_mean",
    "conso_ener_mean",
    "estim_ges_mean",
    "conso_ener_std",
    "estim_ges_std",
    "conso_ener_min",
    "estim_ges_min",
    "conso_ener_max",
    "estim_ges_max",
    "ratio_ges_conso",
    "enr_solaire_photovoltaique",
    "enr_solaire_thermique_(chauffage)",
    "enr_solaire_thermique_(ecs)",
    "enr_solaire_thermique_(ecs+chauffage)",
    "baie_u",
    "mur_u_ext",
    "pb_u",
    "ph_u",
    "mur_pos_isol_ext",
    "prc_s_vitree_ext",
    "presence_balcon",
    "presence_climatisation",
    "baie_orientation_indetermine",
    "baie_orientation_nord",
    "baie_orientation_ouest",
    "baie_orientation_est",
    "baie_orientation_horizontale",
    "baie_orientation_est_ou_ouest",
    "baie_orientation_sud",
    "distance_batiment_historique_plus_proche",
    "qpv",
    "nb_lot_garpark",
    "nb_lot_tot",
    "nb_log",
    "nb_lot_tertiaire",
    "alea_argiles",
    "alea_radon",
];

/// Columns contributed by the external layers (transit, parks, facilities)
pub const OTHER_VARS: &[&str] = &[
    "distance_transport",
    "distance_espace_vert",
    "nb_commerces",
    "nb_enseignement",
    "nb_sante",
    "nb_services",
    "nb_sport_loisirs",
    "nb_transport_tourisme",
];

pub const DISCRETE_VARS: &[&str] = &[
    "nombre_pieces_principales",
    "nb_lot_garpark",
    "nb_lot_tot",
    "nb_log",
    "nb_lot_tertiaire",
];

pub const CATEGORICAL_VARS: &[&str] = &["trimestre", "mois", "nombre_pieces_principales", "code_iris"];

/// Identifiers and dates never transformed into features
pub const IDENTIFIER_VARS: &[&str] = &[
    "id_mutation",
    "date_mutation",
    "adresse_numero",
    "code_postal",
    "code_commune",
    "code_departement",
    "latitude",
    "longitude",
    "annee",
    "jour",
];

/// 0/1 flags. They are features as-is: never logged, imputed by mode.
pub const INDICATOR_VARS: &[&str] = &[
    "dependance",
    "enr_solaire_photovoltaique",
    "enr_solaire_thermique_(chauffage)",
    "enr_solaire_thermique_(ecs)",
    "enr_solaire_thermique_(ecs+chauffage)",
    "presence_balcon",
    "presence_climatisation",
    "baie_orientation_indetermine",
    "baie_orientation_nord",
    "baie_orientation_ouest",
    "baie_orientation_est",
    "baie_orientation_horizontale",
    "baie_orientation_est_ou_ouest",
    "baie_orientation_sud",
    "qpv",
];

/// Levels of the list-valued building columns
pub const LIST_VALUED_VARS: &[(&str, &[&str])] = &[
    ("l_etat", &["En projet", "En construction", "En service"]),
    (
        "baie_orientation",
        &[
            "indetermine",
            "nord",
            "ouest",
            "est",
            "horizontale",
            "est ou ouest",
            "sud",
        ],
    ),
    (
        "enr",
        &[
            "solaire photovoltaique",
            "solaire thermique (chauffage)",
            "solaire thermique (ecs)",
            "solaire thermique (ecs+chauffage)",
        ],
    ),
];

/// Known indicator, or a level column expanded from a list-valued variable
pub fn is_indicator_var(name: &str) -> bool {
    INDICATOR_VARS.contains(&name)
        || LIST_VALUED_VARS
            .iter()
            .any(|(var, _)| name.starts_with(&format!("{}_", var)))
}

/// Catalog group a column belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureGroup {
    Transaction,
    Building,
    Other,
}

/// Three disjoint lists of column names
///
/// Every method returns a new catalog; nothing is mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCatalog {
    pub transaction: Vec<String>,
    pub building: Vec<String>,
    pub other: Vec<String>,
}

impl FeatureCatalog {
    /// Catalog of every known variable
    pub fn known() -> Self {
        let own = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
        Self {
            transaction: own(DVF_SELECTED_VARS),
            building: own(BNB_SELECTED_VARS),
            other: own(OTHER_VARS),
        }
    }

    /// Known catalog restricted to columns present in `df`, plus the
    /// location columns when `keep_location` is set
    pub fn for_frame(df: &DataFrame, keep_location: bool) -> Self {
        let known = Self::known();
        let keep = |names: Vec<String>| -> Vec<String> {
            names.into_iter().filter(|n| has_column(df, n)).collect()
        };
        let mut transaction = keep(known.transaction);
        if keep_location {
            let location: Vec<String> = DVF_LOCATION_VARS
                .iter()
                .filter(|n| has_column(df, n) && !transaction.iter().any(|t| t.as_str() == **n))
                .map(|n| n.to_string())
                .collect();
            transaction.extend(location);
        }
        Self {
            transaction,
            building: keep(known.building),
            other: keep(known.other),
        }
    }

    pub fn group_of(&self, name: &str) -> Option<FeatureGroup> {
        if self.transaction.iter().any(|n| n == name) {
            Some(FeatureGroup::Transaction)
        } else if self.building.iter().any(|n| n == name) {
            Some(FeatureGroup::Building)
        } else if self.other.iter().any(|n| n == name) {
            Some(FeatureGroup::Other)
        } else {
            None
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.group_of(name).is_some()
    }

    /// Add `name` to `group`; a no-op if the name is already cataloged
    pub fn with(&self, group: FeatureGroup, name: &str) -> Self {
        let mut next = self.clone();
        if !self.contains(name) {
            next.list_mut(group).push(name.to_string());
        }
        next
    }

    pub fn without(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.transaction.retain(|n| n != name);
        next.building.retain(|n| n != name);
        next.other.retain(|n| n != name);
        next
    }

    /// All names, transaction first
    pub fn all(&self) -> Vec<String> {
        self.transaction
            .iter()
            .chain(&self.building)
            .chain(&self.other)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transaction.len() + self.building.len() + self.other.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list_mut(&mut self, group: FeatureGroup) -> &mut Vec<String> {
        match group {
            FeatureGroup::Transaction => &mut self.transaction,
            FeatureGroup::Building => &mut self.building,
            FeatureGroup::Other => &mut self.other,
        }
    }
}

/// A frame paired with the catalog describing its columns
///
/// The frame's column set always equals the union of the catalog lists.
#[derive(Debug, Clone)]
pub struct Dataset {
    frame: DataFrame,
    catalog: FeatureCatalog,
}

impl Dataset {
    /// Restrict `df` to the cataloged columns
    pub fn new(df: &DataFrame, catalog: FeatureCatalog) -> Result<Self> {
        let frame = frame::select_columns(df, &catalog.all())?;
        Ok(Self { frame, catalog })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    pub fn into_parts(self) -> (DataFrame, FeatureCatalog) {
        (self.frame, self.catalog)
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    /// Add or replace a column. A replaced column keeps its group.
    pub fn add_column(self, group: FeatureGroup, column: Column) -> Result<Self> {
        let catalog = self.catalog.with(group, column.name().as_str());
        let frame = frame::set_column(self.frame, column)?;
        Ok(Self { frame, catalog })
    }

    /// Replace the payload of an existing column
    pub fn replace_column(self, column: Column) -> Result<Self> {
        let name = column.name().to_string();
        let group = self
            .catalog
            .group_of(&name)
            .ok_or(PipelineError::MissingColumn(name))?;
        self.add_column(group, column)
    }

    pub fn drop_column(self, name: &str) -> Result<Self> {
        Ok(Self {
            frame: frame::drop_column(self.frame, name)?,
            catalog: self.catalog.without(name),
        })
    }

    /// Apply a row-level transformation; the catalog is unchanged
    pub fn map_rows(self, f: impl FnOnce(&DataFrame) -> Result<DataFrame>) -> Result<Self> {
        let frame = f(&self.frame)?;
        Ok(Self {
            frame,
            catalog: self.catalog,
        })
    }

    /// Column names currently in the frame that are not cataloged, and
    /// cataloged names missing from the frame. Both are empty when in sync.
    pub fn drift(&self) -> (Vec<String>, Vec<String>) {
        let untracked = column_names(&self.frame)
            .into_iter()
            .filter(|n| !self.catalog.contains(n))
            .collect();
        let dangling = self
            .catalog
            .all()
            .into_iter()
            .filter(|n| !has_column(&self.frame, n))
            .collect();
        (untracked, dangling)
    }
}
