//! The kinds of data a permission or upload can be scoped to.

pub const SUPPORTED_ASSAYS: [&str; 19] = [
    "atacseq_fastq",
    "clinical_data",
    "ctdna",
    "cytof",
    "elisa",
    "hande",
    "ihc",
    "mibi",
    "microbiome",
    "mif",
    "misc_data",
    "nanostring",
    "olink",
    "rna_bam",
    "rna_fastq",
    "tcr_adaptive",
    "tcr_fastq",
    "wes_bam",
    "wes_fastq",
];

pub const SUPPORTED_ANALYSES: [&str; 7] = [
    "atacseq_analysis",
    "ctdna_analysis",
    "cytof_analysis",
    "rna_level1_analysis",
    "tcr_analysis",
    "wes_analysis",
    "wes_tumor_only_analysis",
];

pub const SUPPORTED_MANIFESTS: [&str; 9] = [
    "h_and_e",
    "microbiome_dna",
    "normal_blood_dna",
    "normal_tissue_dna",
    "pbmc",
    "plasma",
    "tissue_slide",
    "tumor_tissue_dna",
    "tumor_tissue_rna",
];

/// Upload types that have no assay or manifest of their own but on which
/// access can still be granted.
pub const EXTRA_DATA_TYPES: [&str; 2] = ["participants info", "samples info"];

#[must_use]
pub fn is_manifest(upload_type: &str) -> bool {
    SUPPORTED_MANIFESTS.contains(&upload_type)
}

#[must_use]
pub fn is_known(upload_type: &str) -> bool {
    is_manifest(upload_type)
        || SUPPORTED_ASSAYS.contains(&upload_type)
        || SUPPORTED_ANALYSES.contains(&upload_type)
        || EXTRA_DATA_TYPES.contains(&upload_type)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("pbmc", true, true)]
    #[case("olink", false, true)]
    #[case("wes_analysis", false, true)]
    #[case("samples info", false, true)]
    #[case("bogus", false, false)]
    fn classification(#[case] upload_type: &str, #[case] manifest: bool, #[case] known: bool) {
        assert_eq!(is_manifest(upload_type), manifest);
        assert_eq!(is_known(upload_type), known);
    }
}
