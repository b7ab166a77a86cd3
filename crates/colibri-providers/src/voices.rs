//! Prebuilt Gemini TTS voice catalog.
//!
//! Fixed enumerated set; `/set_voice` validates against it and `/voices`
//! renders it.

pub const DEFAULT_VOICE: &str = "Kore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voice {
    pub name: &'static str,
    pub description: &'static str,
    pub gender: &'static str,
    pub style: &'static str,
}

pub const CATALOG: &[Voice] = &[
    Voice { name: "Kore", description: "Voz femenina firme y profesional", gender: "femenina", style: "firme" },
    Voice { name: "Puck", description: "Voz optimista y alegre", gender: "femenina", style: "optimista" },
    Voice { name: "Charon", description: "Voz informativa y clara", gender: "masculina", style: "informativa" },
    Voice { name: "Fenrir", description: "Voz con tono de excitabilidad", gender: "masculina", style: "excitada" },
    Voice { name: "Leda", description: "Voz juvenil y energética", gender: "femenina", style: "juvenil" },
    Voice { name: "Orus", description: "Voz firme y confiable", gender: "masculina", style: "firme" },
    Voice { name: "Aoede", description: "Voz suave y breezy", gender: "femenina", style: "suave" },
    Voice { name: "Callirrhoe", description: "Voz tranquila y calmada", gender: "femenina", style: "calmada" },
    Voice { name: "Autonoe", description: "Voz brillante y expresiva", gender: "femenina", style: "expresiva" },
    Voice { name: "Enceladus", description: "Voz con calidad respiratoria", gender: "masculina", style: "susurrante" },
    Voice { name: "Iapetus", description: "Voz clara y nítida", gender: "masculina", style: "clara" },
    Voice { name: "Umbriel", description: "Voz relajada y calmada", gender: "masculina", style: "relajada" },
    Voice { name: "Algieba", description: "Voz suave y delicada", gender: "femenina", style: "suave" },
    Voice { name: "Despina", description: "Voz suave y melodiosa", gender: "femenina", style: "suave" },
    Voice { name: "Erinome", description: "Voz clara y despejada", gender: "femenina", style: "clara" },
    Voice { name: "Algenib", description: "Voz arenosa y única", gender: "masculina", style: "única" },
    Voice { name: "Rasalgethi", description: "Voz informativa y clara", gender: "masculina", style: "informativa" },
    Voice { name: "Laomedeia", description: "Voz optimista y positiva", gender: "femenina", style: "optimista" },
    Voice { name: "Achernar", description: "Voz suave y agradable", gender: "masculina", style: "suave" },
    Voice { name: "Alnilam", description: "Voz firme y confiable", gender: "masculina", style: "firme" },
    Voice { name: "Schedar", description: "Voz par y equilibrada", gender: "femenina", style: "equilibrada" },
    Voice { name: "Gacrux", description: "Voz apropiada para contenido para mayores", gender: "masculina", style: "madura" },
    Voice { name: "Pulcherrima", description: "Voz hacia adelante y directa", gender: "femenina", style: "directa" },
    Voice { name: "Achird", description: "Voz amistosa y cercana", gender: "masculina", style: "amistosa" },
    Voice { name: "Zubenelgenubi", description: "Voz casual y relajada", gender: "masculina", style: "casual" },
    Voice { name: "Vindemiatrix", description: "Voz suave y tranquilizadora", gender: "femenina", style: "tranquilizadora" },
    Voice { name: "Sadachbia", description: "Voz animada y energética", gender: "femenina", style: "animada" },
    Voice { name: "Sadaltager", description: "Voz con tono de conocimiento", gender: "masculina", style: "sabia" },
    Voice { name: "Sulafat", description: "Voz cálida y acogedora", gender: "femenina", style: "cálida" },
    Voice { name: "Zephyr", description: "Voz iluminada y brillante", gender: "femenina", style: "brillante" },
];

/// Case-insensitive lookup returning the canonical catalog entry.
pub fn find(name: &str) -> Option<&'static Voice> {
    let name = name.trim();
    CATALOG
        .iter()
        .find(|voice| voice.name.eq_ignore_ascii_case(name))
}

/// A short sample of valid names, for guidance messages.
pub fn sample_names(count: usize) -> Vec<&'static str> {
    CATALOG.iter().take(count).map(|voice| voice.name).collect()
}
