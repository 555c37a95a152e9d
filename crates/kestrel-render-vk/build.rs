use std::{env, fs, path::PathBuf};

// Scene triangle: positions and colours are baked into the shader, the model
// transform arrives as a push constant.
const TRI_VERT: &str = r#"
#version 450
layout(push_constant) uniform Push { mat4 transform; } pc;

layout(location = 0) out vec3 vColor;

const vec2 POSITIONS[3] = vec2[](
    vec2( 0.0, -0.6),
    vec2( 0.6,  0.5),
    vec2(-0.6,  0.5)
);
const vec3 COLORS[3] = vec3[](
    vec3(1.0, 0.3, 0.2),
    vec3(0.2, 1.0, 0.4),
    vec3(0.3, 0.4, 1.0)
);

void main() {
    vColor = COLORS[gl_VertexIndex];
    gl_Position = pc.transform * vec4(POSITIONS[gl_VertexIndex], 0.0, 1.0);
}
"#;

const TRI_FRAG: &str = r#"
#version 450
layout(location = 0) in vec3 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0);
}
"#;

// Overlay quad: rect is (x, y, w, h) in NDC, corners come from gl_VertexIndex
// as a 4-vertex triangle strip.
const QUAD_VERT: &str = r#"
#version 450
layout(push_constant) uniform Push { vec4 rect; } pc;

layout(location = 0) out vec2 vUv;

void main() {
    vec2 corner = vec2(gl_VertexIndex & 1, (gl_VertexIndex >> 1) & 1);
    vUv = corner;
    gl_Position = vec4(pc.rect.xy + corner * pc.rect.zw, 0.0, 1.0);
}
"#;

const QUAD_FRAG: &str = r#"
#version 450
layout(set = 0, binding = 0) uniform sampler2D uTexture;

layout(location = 0) in vec2 vUv;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = texture(uTexture, vUv);
}
"#;

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let shaders = [
        ("tri.vert", TRI_VERT, shaderc::ShaderKind::Vertex),
        ("tri.frag", TRI_FRAG, shaderc::ShaderKind::Fragment),
        ("quad.vert", QUAD_VERT, shaderc::ShaderKind::Vertex),
        ("quad.frag", QUAD_FRAG, shaderc::ShaderKind::Fragment),
    ];

    for (name, src, kind) in shaders {
        let spv = comp
            .compile_into_spirv(src, kind, name, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8()).unwrap();
    }

    // Inline sources live here.
    println!("cargo:rerun-if-changed=build.rs");
}
