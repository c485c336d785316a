//! Anatomical bundle naming conventions
//!
//! Class order matters: the network's output channels follow these lists
//! exactly, and output files are named after them.

/// The 72 bundles of the TractQuerier+ tract definition
pub const TRACTSEG_BUNDLES: [&str; 72] = [
    "AF_left", "AF_right", "ATR_left", "ATR_right", "CA",
    "CC_1", "CC_2", "CC_3", "CC_4", "CC_5", "CC_6", "CC_7",
    "CG_left", "CG_right", "CST_left", "CST_right", "MLF_left", "MLF_right",
    "FPT_left", "FPT_right", "FX_left", "FX_right", "ICP_left", "ICP_right",
    "IFO_left", "IFO_right", "ILF_left", "ILF_right", "MCP", "OR_left", "OR_right",
    "POPT_left", "POPT_right", "SCP_left", "SCP_right",
    "SLF_I_left", "SLF_I_right", "SLF_II_left", "SLF_II_right", "SLF_III_left", "SLF_III_right",
    "STR_left", "STR_right", "UF_left", "UF_right", "CC",
    "T_PREF_left", "T_PREF_right", "T_PREM_left", "T_PREM_right",
    "T_PREC_left", "T_PREC_right", "T_POSTC_left", "T_POSTC_right",
    "T_PAR_left", "T_PAR_right", "T_OCC_left", "T_OCC_right",
    "ST_FO_left", "ST_FO_right", "ST_PREF_left", "ST_PREF_right",
    "ST_PREM_left", "ST_PREM_right", "ST_PREC_left", "ST_PREC_right",
    "ST_POSTC_left", "ST_POSTC_right", "ST_PAR_left", "ST_PAR_right",
    "ST_OCC_left", "ST_OCC_right",
];

/// The 42 bundles of the XTRACT tract definition
pub const XTRACT_BUNDLES: [&str; 42] = [
    "ac", "af_l", "af_r", "ar_l", "ar_r", "atr_l", "atr_r",
    "cbd_l", "cbd_r", "cbp_l", "cbp_r", "cbt_l", "cbt_r",
    "cst_l", "cst_r", "fa_l", "fa_r", "fma", "fmi", "fx_l", "fx_r",
    "ifo_l", "ifo_r", "ilf_l", "ilf_r", "mcp", "mdlf_l", "mdlf_r",
    "or_l", "or_r", "slf1_l", "slf1_r", "slf2_l", "slf2_r", "slf3_l", "slf3_r",
    "str_l", "str_r", "uf_l", "uf_r", "vof_l", "vof_r",
];

/// Number of bundles handled by each part of the split TOM model
pub const TOM_PART_SIZE: usize = 18;

/// Endings classes: a `_b` (beginning) and `_e` (ending) region per bundle
pub fn endings_classes(bundles: &[&str]) -> Vec<String> {
    bundles
        .iter()
        .flat_map(|b| [format!("{b}_b"), format!("{b}_e")])
        .collect()
}

/// Split the bundle list into the parts served by separate TOM models
pub fn tom_parts(bundles: &[&'static str]) -> Vec<Vec<&'static str>> {
    bundles.chunks(TOM_PART_SIZE).map(<[_]>::to_vec).collect()
}

/// Index of `name` in `bundles`
pub fn bundle_index(bundles: &[&str], name: &str) -> Option<usize> {
    bundles.iter().position(|b| *b == name)
}
