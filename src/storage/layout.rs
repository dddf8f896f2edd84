//! On-disk naming of received objects

use std::path::PathBuf;

use crate::models::DicomObject;

/// Replace characters that are unsafe in file and folder names with `_`
pub fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '^' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

/// `<patient>/<study>/<series>/<MODALITY>_<SOPInstanceUID>.dcm`
pub fn object_relative_path(object: &DicomObject) -> PathBuf {
    let mut path = PathBuf::from(sanitize(&object.patient_id));
    path.push(sanitize(&object.study_uid));
    path.push(sanitize(&object.series_uid));
    path.push(format!(
        "{}_{}.dcm",
        sanitize(&object.modality_code.to_ascii_uppercase()),
        sanitize(&object.instance_uid)
    ));
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::plan::tests::object;
    use crate::models::Modality;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Doe^John"), "Doe_John");
        assert_eq!(sanitize("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize("tab\there"), "tab_here");
        assert_eq!(sanitize(".."), "__");
        assert_eq!(sanitize("  "), "_");
        assert_eq!(sanitize("1.2.840.1"), "1.2.840.1");
    }

    #[test]
    fn test_object_relative_path() {
        let mut obj = object("PAT/1", "1.2", Modality::Plan, "1.2.3.4");
        obj.series_uid = "1.2.9".into();
        assert_eq!(
            object_relative_path(&obj),
            PathBuf::from("PAT_1/1.2/1.2.9/RTPLAN_1.2.3.4.dcm")
        );
    }
}
